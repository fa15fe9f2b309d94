//! Architecture adapter seam.
//!
//! Each supported model family implements [`ModelAdapter`] as a capability
//! interface: the pipeline driver asks it to run the bottom stage, compress
//! the head, and execute or instrument a single decoder layer. The variant
//! is selected once at initialization; there is no inheritance chain.

use candle_core::{Device, Tensor};

use crate::calibration::CalibrationDataset;
use crate::config::CompressionConfig;
use crate::layers::LayerWeights;
use crate::pipeline::{PipelineState, StateUpdate};
use crate::solver::WeightSolver;

use super::LayerwiseModel;

/// Capability interface of one architecture family.
pub trait ModelAdapter: Send {
    /// Naming convention of this family
    fn layer_names(&self) -> &LayerNames;

    /// In-layer projection paths targeted by the solver, in forward order
    fn target_projections(&self) -> &[&'static str];

    /// Compress entry layers if needed and push all calibration data through
    /// them. The returned update must populate `outputs` with one
    /// hidden-states tensor per calibration batch, plus the attention mask,
    /// position ids, and the captured `use_cache` flag.
    fn bottom_compress(
        &self,
        model: &mut LayerwiseModel,
        device: &Device,
        data: &CalibrationDataset,
        config: &CompressionConfig,
    ) -> crate::Result<StateUpdate>;

    /// Compress a trailing output head against the final layer's
    /// activations. Returns `None` when the model has no separate head.
    fn head_compress(
        &self,
        model: &mut LayerwiseModel,
        device: &Device,
        state: &PipelineState,
        solver: &dyn WeightSolver,
        config: &CompressionConfig,
    ) -> crate::Result<Option<StateUpdate>>;

    /// Run one decoder layer forward
    fn forward_layer(
        &self,
        weights: &LayerWeights,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        position_ids: &Tensor,
    ) -> crate::Result<Tensor>;

    /// Instrumented forward: capture the input activations feeding each
    /// target projection. This is the pipeline's deliberate capture step;
    /// no hooks are installed anywhere.
    fn capture_projection_inputs(
        &self,
        weights: &LayerWeights,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        position_ids: &Tensor,
    ) -> crate::Result<Vec<(String, Tensor)>>;
}

/// Parameter paths for one architecture family.
///
/// Layer-internal paths are relative to a decoder layer (the checkpoint
/// loader strips the `model.layers.N.` prefix).
#[derive(Debug, Clone)]
pub struct LayerNames {
    pub embed_tokens: &'static str,
    pub layers_prefix: &'static str,
    pub q_proj: &'static str,
    pub k_proj: &'static str,
    pub v_proj: &'static str,
    pub o_proj: &'static str,
    pub gate_proj: &'static str,
    pub up_proj: &'static str,
    pub down_proj: &'static str,
    pub input_layernorm: &'static str,
    pub post_attention_layernorm: &'static str,
    pub norm: &'static str,
    pub lm_head: &'static str,
}

impl LayerNames {
    /// Get layer names for Llama architecture
    pub fn llama() -> Self {
        Self {
            embed_tokens: "model.embed_tokens",
            layers_prefix: "model.layers",
            q_proj: "self_attn.q_proj",
            k_proj: "self_attn.k_proj",
            v_proj: "self_attn.v_proj",
            o_proj: "self_attn.o_proj",
            gate_proj: "mlp.gate_proj",
            up_proj: "mlp.up_proj",
            down_proj: "mlp.down_proj",
            input_layernorm: "input_layernorm",
            post_attention_layernorm: "post_attention_layernorm",
            norm: "model.norm",
            lm_head: "lm_head",
        }
    }

    /// Get layer names for Mistral architecture (same as Llama)
    pub fn mistral() -> Self {
        Self::llama()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_names() {
        let names = LayerNames::llama();
        assert_eq!(names.embed_tokens, "model.embed_tokens");
        assert_eq!(names.q_proj, "self_attn.q_proj");
        assert_eq!(names.layers_prefix, "model.layers");
    }
}
