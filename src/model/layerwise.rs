//! The in-memory model being compressed.
//!
//! A `LayerwiseModel` keeps host copies of every weight group. Compression
//! mutates it in place: the layer compressor uploads one layer to the
//! compute device, solves, and writes the compressed tensors back.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Tensor};

use crate::config::ModelConfig;
use crate::layers::{CheckpointLoader, LayerWeights};

/// One decoder layer with its checkpoint name (e.g. `model.layers.3`).
#[derive(Debug)]
pub struct DecoderLayer {
    pub name: String,
    pub weights: LayerWeights,
}

/// An ordered, named collection of weight groups, mutated in place during
/// compression.
pub struct LayerwiseModel {
    config: ModelConfig,
    embed_tokens: Tensor,
    layers: Vec<DecoderLayer>,
    norm_weight: Tensor,
    lm_head_weight: Option<Tensor>,
    /// Calibration-time instrumentation flag, cleared by the finalizer
    observers_enabled: bool,
}

impl LayerwiseModel {
    /// Load a checkpoint directory (config.json + safetensors shards) into
    /// host memory.
    pub fn load(model_path: impl AsRef<Path>, dtype: DType) -> crate::Result<Self> {
        let model_path = model_path.as_ref();

        let config_path = model_path.join("config.json");
        if !config_path.exists() {
            return Err(crate::SparseLLMError::ModelNotFound(format!(
                "no config.json in {:?}",
                model_path
            )));
        }
        let config = ModelConfig::from_file(config_path)?;

        tracing::info!(
            "Loading {} layers from {:?}",
            config.num_hidden_layers,
            model_path
        );

        let mut grouped = CheckpointLoader::new(model_path, dtype).load()?;

        let embed_tokens = grouped.embedding.take().ok_or_else(|| {
            crate::SparseLLMError::LayerLoad("checkpoint has no embedding weight".to_string())
        })?;
        let norm_weight = grouped.final_norm.take().ok_or_else(|| {
            crate::SparseLLMError::LayerLoad("checkpoint has no final norm weight".to_string())
        })?;
        let lm_head_weight = grouped.lm_head.take();

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for idx in 0..config.num_hidden_layers {
            let tensors = grouped.layers.remove(&idx).ok_or_else(|| {
                crate::SparseLLMError::LayerLoad(format!("checkpoint is missing layer {}", idx))
            })?;
            layers.push(DecoderLayer {
                name: format!("model.layers.{}", idx),
                weights: LayerWeights::new(idx, tensors),
            });
        }

        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm_weight,
            lm_head_weight,
            observers_enabled: false,
        })
    }

    /// Assemble a model from already-built tensors (tools and tests).
    pub fn from_parts(
        config: ModelConfig,
        embed_tokens: Tensor,
        layer_tensors: Vec<HashMap<String, Tensor>>,
        norm_weight: Tensor,
        lm_head_weight: Option<Tensor>,
    ) -> Self {
        let layers = layer_tensors
            .into_iter()
            .enumerate()
            .map(|(idx, tensors)| DecoderLayer {
                name: format!("model.layers.{}", idx),
                weights: LayerWeights::new(idx, tensors),
            })
            .collect();

        Self {
            config,
            embed_tokens,
            layers,
            norm_weight,
            lm_head_weight,
            observers_enabled: false,
        }
    }

    /// Enumerate compressible layers matching a name-prefix selector, in
    /// architectural order.
    pub fn get_layers(&self, selector: &str) -> crate::Result<Vec<(String, usize)>> {
        let matched: Vec<(String, usize)> = self
            .layers
            .iter()
            .enumerate()
            .filter(|(_, layer)| layer.name.starts_with(selector))
            .map(|(idx, layer)| (layer.name.clone(), idx))
            .collect();

        if matched.is_empty() {
            return Err(crate::SparseLLMError::Configuration(format!(
                "no layers match selector '{}'",
                selector
            )));
        }

        Ok(matched)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[DecoderLayer] {
        &self.layers
    }

    pub fn layer(&self, idx: usize) -> crate::Result<&DecoderLayer> {
        self.layers.get(idx).ok_or_else(|| {
            crate::SparseLLMError::LayerLoad(format!(
                "layer index {} out of range (max {})",
                idx,
                self.layers.len().saturating_sub(1)
            ))
        })
    }

    pub fn layer_mut(&mut self, idx: usize) -> crate::Result<&mut DecoderLayer> {
        let max = self.layers.len().saturating_sub(1);
        self.layers.get_mut(idx).ok_or_else(|| {
            crate::SparseLLMError::LayerLoad(format!(
                "layer index {} out of range (max {})",
                idx, max
            ))
        })
    }

    pub fn embed_tokens(&self) -> &Tensor {
        &self.embed_tokens
    }

    pub fn set_embed_tokens(&mut self, tensor: Tensor) {
        self.embed_tokens = tensor;
    }

    pub fn norm_weight(&self) -> &Tensor {
        &self.norm_weight
    }

    pub fn lm_head_weight(&self) -> Option<&Tensor> {
        self.lm_head_weight.as_ref()
    }

    pub fn set_lm_head_weight(&mut self, tensor: Tensor) {
        self.lm_head_weight = Some(tensor);
    }

    /// KV-cache flag; captured before compression, restored by the finalizer
    pub fn use_cache(&self) -> bool {
        self.config.use_cache
    }

    pub fn set_use_cache(&mut self, use_cache: bool) {
        self.config.use_cache = use_cache;
    }

    pub fn observers_enabled(&self) -> bool {
        self.observers_enabled
    }

    pub fn enable_calibration_observers(&mut self) {
        self.observers_enabled = true;
    }

    /// Idempotent: safe to call when no observers are attached.
    pub fn disable_calibration_observers(&mut self) {
        self.observers_enabled = false;
    }
}

impl std::fmt::Debug for LayerwiseModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerwiseModel")
            .field("architecture", &self.config.architecture())
            .field("num_layers", &self.layers.len())
            .field("has_lm_head", &self.lm_head_weight.is_some())
            .field("observers_enabled", &self.observers_enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            architectures: vec!["LlamaForCausalLM".to_string()],
            hidden_size: 8,
            intermediate_size: 16,
            num_attention_heads: 2,
            num_key_value_heads: None,
            num_hidden_layers: 2,
            rms_norm_eps: 1e-5,
            vocab_size: 32,
            max_position_embeddings: 16,
            rope_theta: 10000.0,
            use_cache: true,
            tie_word_embeddings: false,
        }
    }

    fn tiny_model() -> LayerwiseModel {
        let device = Device::Cpu;
        let embed = Tensor::zeros((32, 8), DType::F32, &device).unwrap();
        let norm = Tensor::ones((8,), DType::F32, &device).unwrap();
        let layers = vec![HashMap::new(), HashMap::new()];
        LayerwiseModel::from_parts(tiny_config(), embed, layers, norm, None)
    }

    #[test]
    fn test_get_layers_selector() {
        let model = tiny_model();

        let layers = model.get_layers("model.layers").unwrap();
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0], ("model.layers.0".to_string(), 0));
        assert_eq!(layers[1], ("model.layers.1".to_string(), 1));
    }

    #[test]
    fn test_empty_selector_match_is_configuration_error() {
        let model = tiny_model();
        let err = model.get_layers("decoder.blocks").unwrap_err();
        assert!(matches!(err, crate::SparseLLMError::Configuration(_)));
    }

    #[test]
    fn test_observer_flag_idempotent() {
        let mut model = tiny_model();
        assert!(!model.observers_enabled());

        model.enable_calibration_observers();
        assert!(model.observers_enabled());

        model.disable_calibration_observers();
        model.disable_calibration_observers();
        assert!(!model.observers_enabled());
    }

    #[test]
    fn test_use_cache_roundtrip() {
        let mut model = tiny_model();
        assert!(model.use_cache());
        model.set_use_cache(false);
        assert!(!model.use_cache());
        assert!(!model.config().use_cache);
    }
}
