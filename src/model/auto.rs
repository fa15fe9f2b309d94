//! Adapter selection from detected architecture.

use candle_core::{DType, Device};

use crate::config::{ModelArchitecture, ModelConfig};

use super::llama::LlamaAdapter;
use super::ModelAdapter;

/// Pick the architecture adapter for a model, selected once at
/// initialization.
pub fn adapter_for(
    config: &ModelConfig,
    device: &Device,
    dtype: DType,
) -> crate::Result<Box<dyn ModelAdapter>> {
    let architecture = config.architecture();
    tracing::info!("Detected architecture: {:?}", architecture);

    match architecture {
        ModelArchitecture::Llama | ModelArchitecture::Mistral | ModelArchitecture::Mixtral => {
            Ok(Box::new(LlamaAdapter::new(config, device, dtype)?))
        }
        ModelArchitecture::Qwen | ModelArchitecture::Qwen2 => {
            // Fused-qkv checkpoints need their own capture/solve layout
            Err(crate::SparseLLMError::UnsupportedArchitecture(format!(
                "{:?}",
                architecture
            )))
        }
        ModelArchitecture::Unknown(arch) => {
            tracing::warn!(
                "Unknown architecture '{}', attempting Llama layer layout",
                arch
            );
            Ok(Box::new(LlamaAdapter::new(config, device, dtype)?))
        }
    }
}
