//! Model configuration structures for various LLM architectures.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Storage format for compressed model weights on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightStorage {
    /// Dense safetensors (zeros stored explicitly)
    #[default]
    Dense,
    /// 8-bit blockwise quantized blobs
    Int8,
    /// 4-bit NF4 quantized blobs
    Nf4,
}

impl WeightStorage {
    /// Returns the storage ratio (stored / original size)
    pub fn ratio(&self) -> f32 {
        match self {
            WeightStorage::Dense => 1.0,
            WeightStorage::Int8 => 0.5,
            WeightStorage::Nf4 => 0.25,
        }
    }
}

/// Supported model architectures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelArchitecture {
    Llama,
    Mistral,
    Mixtral,
    Qwen,
    Qwen2,
    Unknown(String),
}

impl ModelArchitecture {
    /// Detect architecture from config.json architectures field
    pub fn from_architectures(architectures: &[String]) -> Self {
        if architectures.is_empty() {
            return ModelArchitecture::Unknown("empty".to_string());
        }

        let arch = &architectures[0];

        if arch.contains("Qwen2") {
            ModelArchitecture::Qwen2
        } else if arch.contains("Qwen") || arch.contains("QWen") {
            ModelArchitecture::Qwen
        } else if arch.contains("Mixtral") {
            ModelArchitecture::Mixtral
        } else if arch.contains("Mistral") {
            ModelArchitecture::Mistral
        } else if arch.contains("Llama") {
            ModelArchitecture::Llama
        } else {
            ModelArchitecture::Unknown(arch.clone())
        }
    }
}

/// Base model configuration loaded from config.json
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model architecture type(s)
    #[serde(default)]
    pub architectures: Vec<String>,

    /// Hidden size (embedding dimension)
    pub hidden_size: usize,

    /// Intermediate size in MLP layers
    pub intermediate_size: usize,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of key-value heads (for GQA)
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,

    /// Number of transformer layers
    pub num_hidden_layers: usize,

    /// RMS norm epsilon
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    /// Vocabulary size
    pub vocab_size: usize,

    /// Maximum sequence length
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,

    /// Rope theta for positional encoding
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// KV-cache flag; captured before compression and restored by the finalizer
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,

    /// Tie word embeddings
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

fn default_max_position_embeddings() -> usize {
    4096
}

fn default_rope_theta() -> f64 {
    10000.0
}

fn default_use_cache() -> bool {
    true
}

impl ModelConfig {
    /// Load configuration from a config.json file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ModelConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Get the detected model architecture
    pub fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture::from_architectures(&self.architectures)
    }

    /// Get number of KV heads (defaults to num_attention_heads for MHA)
    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    /// Get head dimension
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Check if using grouped query attention
    pub fn is_gqa(&self) -> bool {
        self.num_kv_heads() != self.num_attention_heads
    }
}
