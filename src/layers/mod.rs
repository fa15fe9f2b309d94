//! Weight I/O for layerwise compression.
//!
//! This module provides:
//! - `LayerWeights`: one decoder layer's name-keyed weight tensors
//! - `CheckpointLoader`: read a sharded safetensors checkpoint into layer groups
//! - `CheckpointWriter`: write the compressed model back out

mod loader;
mod writer;

pub use loader::{classify_tensor_name, CheckpointLoader, CheckpointTensors, TensorGroup};
pub use writer::{read_quantized_group, CheckpointWriter};

use candle_core::Tensor;

/// One decoder layer's weight tensors, keyed by in-layer parameter path
/// (e.g. `self_attn.q_proj.weight`).
pub struct LayerWeights {
    /// Layer index in architectural order
    pub layer_idx: usize,
    /// Weight tensors keyed by parameter name
    pub tensors: std::collections::HashMap<String, Tensor>,
}

impl LayerWeights {
    pub fn new(layer_idx: usize, tensors: std::collections::HashMap<String, Tensor>) -> Self {
        Self { layer_idx, tensors }
    }

    /// Look up a parameter, failing with layer context if it is missing.
    pub fn get(&self, name: &str) -> crate::Result<&Tensor> {
        self.tensors.get(name).ok_or_else(|| {
            crate::SparseLLMError::LayerLoad(format!(
                "layer {} is missing parameter '{}'",
                self.layer_idx, name
            ))
        })
    }

    /// Replace a parameter in place (weight update after solving).
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Copy every tensor to the given device.
    pub fn to_device(&self, device: &candle_core::Device) -> crate::Result<LayerWeights> {
        let mut tensors = std::collections::HashMap::with_capacity(self.tensors.len());
        for (name, tensor) in &self.tensors {
            tensors.insert(name.clone(), tensor.to_device(device)?);
        }
        Ok(LayerWeights {
            layer_idx: self.layer_idx,
            tensors,
        })
    }
}

impl std::fmt::Debug for LayerWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerWeights")
            .field("layer_idx", &self.layer_idx)
            .field("num_tensors", &self.tensors.len())
            .finish()
    }
}
