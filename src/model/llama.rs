//! Llama-family adapter: decoder-layer math and compression capabilities.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::Module;

use crate::calibration::CalibrationDataset;
use crate::config::{CompressionConfig, ModelConfig};
use crate::layers::LayerWeights;
use crate::pipeline::{PipelineState, StateUpdate};
use crate::quantization::{Int8Quantizer, Quantizer};
use crate::solver::{InputStats, SolveTarget, WeightSolver};

use super::base::{LayerNames, ModelAdapter};
use super::LayerwiseModel;

/// Projection paths the solver targets inside every Llama decoder layer,
/// in forward order.
const TARGET_PROJECTIONS: [&str; 7] = [
    "self_attn.q_proj",
    "self_attn.k_proj",
    "self_attn.v_proj",
    "self_attn.o_proj",
    "mlp.gate_proj",
    "mlp.up_proj",
    "mlp.down_proj",
];

/// Collects (projection name, input activations) pairs during an
/// instrumented forward pass. Inert when constructed empty, so the true
/// forward pass shares the same code path without cloning anything.
struct CaptureSink<'a>(Option<&'a mut Vec<(String, Tensor)>>);

impl CaptureSink<'_> {
    fn record(&mut self, name: &str, activations: &Tensor) {
        if let Some(captured) = self.0.as_mut() {
            captured.push((name.to_string(), activations.clone()));
        }
    }
}

/// Adapter for Llama/Mistral-style checkpoints.
pub struct LlamaAdapter {
    config: ModelConfig,
    dtype: DType,
    names: LayerNames,
    /// RoPE tables `[max_position_embeddings, head_dim]` on the compute device
    rope_cos: Tensor,
    rope_sin: Tensor,
}

impl LlamaAdapter {
    pub fn new(config: &ModelConfig, device: &Device, dtype: DType) -> crate::Result<Self> {
        let (rope_cos, rope_sin) = Self::build_rope_tables(config, device, dtype)?;

        Ok(Self {
            config: config.clone(),
            dtype,
            names: LayerNames::llama(),
            rope_cos,
            rope_sin,
        })
    }

    fn build_rope_tables(
        config: &ModelConfig,
        device: &Device,
        dtype: DType,
    ) -> crate::Result<(Tensor, Tensor)> {
        let head_dim = config.head_dim();
        let max_seq_len = config.max_position_embeddings;
        let theta = config.rope_theta;

        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (theta as f32).powf(i as f32 / head_dim as f32))
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, &[head_dim / 2], device)?;

        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::from_vec(positions, &[max_seq_len], device)?;

        // Outer product, duplicated for the rotated-half representation:
        // [max_seq_len, head_dim]
        let freqs = positions.unsqueeze(1)?.matmul(&inv_freq.unsqueeze(0)?)?;
        let freqs = Tensor::cat(&[&freqs, &freqs], 1)?;

        let cos = freqs.cos()?.to_dtype(dtype)?;
        let sin = freqs.sin()?.to_dtype(dtype)?;

        Ok((cos, sin))
    }

    /// RMS normalization
    fn rms_norm(&self, x: &Tensor, weight: &Tensor) -> crate::Result<Tensor> {
        let eps = self.config.rms_norm_eps;

        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let rms = (variance + eps)?.sqrt()?;

        let normalized = x.broadcast_div(&rms)?;
        normalized.broadcast_mul(weight).map_err(Into::into)
    }

    /// Apply rotary embeddings to q and k at the given positions
    fn apply_rope(
        &self,
        q: &Tensor,
        k: &Tensor,
        position_ids: &Tensor,
    ) -> crate::Result<(Tensor, Tensor)> {
        let positions = position_ids.squeeze(0)?;
        let cos = self.rope_cos.index_select(&positions, 0)?;
        let sin = self.rope_sin.index_select(&positions, 0)?;

        let q_embed = Self::rotate_half(q, &cos, &sin)?;
        let k_embed = Self::rotate_half(k, &cos, &sin)?;

        Ok((q_embed, k_embed))
    }

    fn rotate_half(x: &Tensor, cos: &Tensor, sin: &Tensor) -> crate::Result<Tensor> {
        let dims = x.dims();
        let half_dim = dims[dims.len() - 1] / 2;

        let x1 = x.narrow(D::Minus1, 0, half_dim)?;
        let x2 = x.narrow(D::Minus1, half_dim, half_dim)?;

        // Add batch and head dims: [1, 1, seq, head_dim]
        let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
        let sin = sin.unsqueeze(0)?.unsqueeze(0)?;

        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;
        let out = (x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?)?;
        Ok(out)
    }

    /// Lower-triangular additive mask, `-1e10` above the diagonal
    pub fn create_causal_mask(
        seq_len: usize,
        device: &Device,
        dtype: DType,
    ) -> crate::Result<Tensor> {
        let mut mask_data = vec![0.0f32; seq_len * seq_len];
        for i in 0..seq_len {
            for j in (i + 1)..seq_len {
                mask_data[i * seq_len + j] = -1e10;
            }
        }

        Tensor::from_vec(mask_data, &[seq_len, seq_len], device)?
            .to_dtype(dtype)
            .map_err(Into::into)
    }

    fn forward_attention(
        &self,
        normed: &Tensor,
        weights: &LayerWeights,
        attention_mask: Option<&Tensor>,
        position_ids: &Tensor,
        sink: &mut CaptureSink<'_>,
    ) -> crate::Result<Tensor> {
        let (batch_size, seq_len, _) = normed.dims3()?;
        let num_heads = self.config.num_attention_heads;
        let num_kv_heads = self.config.num_kv_heads();
        let head_dim = self.config.head_dim();

        let q_weight = weights.get(&format!("{}.weight", self.names.q_proj))?;
        let k_weight = weights.get(&format!("{}.weight", self.names.k_proj))?;
        let v_weight = weights.get(&format!("{}.weight", self.names.v_proj))?;
        let o_weight = weights.get(&format!("{}.weight", self.names.o_proj))?;

        sink.record(self.names.q_proj, normed);
        sink.record(self.names.k_proj, normed);
        sink.record(self.names.v_proj, normed);

        let q = normed.broadcast_matmul(&q_weight.t()?)?;
        let k = normed.broadcast_matmul(&k_weight.t()?)?;
        let v = normed.broadcast_matmul(&v_weight.t()?)?;

        // [batch, heads, seq, head_dim]
        let q = q
            .reshape(&[batch_size, seq_len, num_heads, head_dim])?
            .transpose(1, 2)?;
        let k = k
            .reshape(&[batch_size, seq_len, num_kv_heads, head_dim])?
            .transpose(1, 2)?;
        let v = v
            .reshape(&[batch_size, seq_len, num_kv_heads, head_dim])?
            .transpose(1, 2)?;

        let (q, k) = self.apply_rope(&q, &k, position_ids)?;

        // Repeat KV heads if using GQA
        let (k, v) = if num_kv_heads != num_heads {
            let n_rep = num_heads / num_kv_heads;
            (k.repeat(&[1, n_rep, 1, 1])?, v.repeat(&[1, n_rep, 1, 1])?)
        } else {
            (k, v)
        };

        let scale = (head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?)? / scale)?;

        let attn_weights = match attention_mask {
            Some(mask) => attn_weights.broadcast_add(mask)?,
            None => {
                let mask = Self::create_causal_mask(seq_len, normed.device(), self.dtype)?;
                attn_weights.broadcast_add(&mask)?
            }
        };

        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;
        let attn_output = attn_weights.matmul(&v)?;

        // Back to [batch, seq, hidden]
        let attn_output = attn_output
            .transpose(1, 2)?
            .reshape(&[batch_size, seq_len, num_heads * head_dim])?;

        sink.record(self.names.o_proj, &attn_output);
        attn_output
            .broadcast_matmul(&o_weight.t()?)
            .map_err(Into::into)
    }

    fn forward_mlp(
        &self,
        normed: &Tensor,
        weights: &LayerWeights,
        sink: &mut CaptureSink<'_>,
    ) -> crate::Result<Tensor> {
        let gate_weight = weights.get(&format!("{}.weight", self.names.gate_proj))?;
        let up_weight = weights.get(&format!("{}.weight", self.names.up_proj))?;
        let down_weight = weights.get(&format!("{}.weight", self.names.down_proj))?;

        sink.record(self.names.gate_proj, normed);
        sink.record(self.names.up_proj, normed);

        // SwiGLU: down(silu(gate(x)) * up(x))
        let gate = normed.broadcast_matmul(&gate_weight.t()?)?;
        let up = normed.broadcast_matmul(&up_weight.t()?)?;
        let hidden = (candle_nn::ops::silu(&gate)? * up)?;

        sink.record(self.names.down_proj, &hidden);
        hidden
            .broadcast_matmul(&down_weight.t()?)
            .map_err(Into::into)
    }

    fn forward_layer_impl(
        &self,
        weights: &LayerWeights,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        position_ids: &Tensor,
        sink: &mut CaptureSink<'_>,
    ) -> crate::Result<Tensor> {
        let input_norm = weights.get(&format!("{}.weight", self.names.input_layernorm))?;
        let post_attn_norm =
            weights.get(&format!("{}.weight", self.names.post_attention_layernorm))?;

        let normed = self.rms_norm(hidden, input_norm)?;
        let attn_output =
            self.forward_attention(&normed, weights, attention_mask, position_ids, sink)?;
        let hidden = (hidden + &attn_output)?;

        let normed = self.rms_norm(&hidden, post_attn_norm)?;
        let mlp_output = self.forward_mlp(&normed, weights, sink)?;

        (&hidden + &mlp_output).map_err(Into::into)
    }
}

impl ModelAdapter for LlamaAdapter {
    fn layer_names(&self) -> &LayerNames {
        &self.names
    }

    fn target_projections(&self) -> &[&'static str] {
        &TARGET_PROJECTIONS
    }

    fn bottom_compress(
        &self,
        model: &mut LayerwiseModel,
        device: &Device,
        data: &CalibrationDataset,
        config: &CompressionConfig,
    ) -> crate::Result<StateUpdate> {
        if data.is_empty() {
            return Err(crate::SparseLLMError::Calibration(
                "calibration dataset is empty".to_string(),
            ));
        }

        // The cache flag is restored by the finalizer; calibration itself
        // runs cache-free
        let previous_use_cache = model.use_cache();
        model.set_use_cache(false);

        if config.quantize() {
            let quantizer = Int8Quantizer::with_block_size(config.block_size());
            let dequantized = quantizer.dequantize(&quantizer.quantize(model.embed_tokens())?)?;
            model.set_embed_tokens(dequantized);
            tracing::info!("Quantized embedding matrix");
        }

        let embed_weight = model.embed_tokens().to_device(device)?;
        let embedding = candle_nn::Embedding::new(embed_weight, self.config.hidden_size);

        let mut outputs = Vec::with_capacity(data.len());
        for batch in data.batches() {
            let input_ids = batch.to_tensor(device)?;
            outputs.push(embedding.forward(&input_ids)?);
        }

        let seq_len = data.seq_len();
        let attention_mask = Self::create_causal_mask(seq_len, device, self.dtype)?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, device)?.unsqueeze(0)?;

        tracing::info!(
            "Bottom stage captured {} calibration batches of {} tokens",
            outputs.len(),
            seq_len
        );

        Ok(StateUpdate {
            outputs: Some(outputs),
            attention_mask: Some(attention_mask),
            position_ids: Some(position_ids),
            use_cache: Some(previous_use_cache),
        })
    }

    fn head_compress(
        &self,
        model: &mut LayerwiseModel,
        device: &Device,
        state: &PipelineState,
        solver: &dyn WeightSolver,
        config: &CompressionConfig,
    ) -> crate::Result<Option<StateUpdate>> {
        let Some(head_weight) = model.lm_head_weight() else {
            return Ok(None);
        };

        let outputs = state.outputs.as_ref().ok_or_else(|| {
            crate::SparseLLMError::pipeline_state("head", "no outputs to compress the head against")
        })?;

        let norm_weight = model.norm_weight().to_device(device)?;

        // The head consumes final-norm activations, so those are what the
        // solver calibrates against
        let mut stats = InputStats::new(self.config.hidden_size);
        let mut normed_outputs = Vec::with_capacity(outputs.len());
        for hidden in outputs {
            let normed = self.rms_norm(hidden, &norm_weight)?;
            stats.update(&normed)?;
            normed_outputs.push(normed);
        }

        let mut targets = [SolveTarget {
            name: self.names.lm_head.to_string(),
            weight: head_weight.to_device(device)?,
            stats,
        }];
        // The head stage is indexed one past the last decoder layer
        let telemetry =
            solver.compress_layer(model.num_layers(), &mut targets, &config.solver_args())?;

        let [target] = targets;
        model.set_lm_head_weight(target.weight.to_device(&Device::Cpu)?);

        tracing::info!(
            "Compressed lm head: sparsity {:.3}",
            telemetry.achieved_sparsity()
        );

        Ok(Some(StateUpdate {
            outputs: Some(normed_outputs),
            ..Default::default()
        }))
    }

    fn forward_layer(
        &self,
        weights: &LayerWeights,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        position_ids: &Tensor,
    ) -> crate::Result<Tensor> {
        self.forward_layer_impl(
            weights,
            hidden,
            attention_mask,
            position_ids,
            &mut CaptureSink(None),
        )
    }

    fn capture_projection_inputs(
        &self,
        weights: &LayerWeights,
        hidden: &Tensor,
        attention_mask: Option<&Tensor>,
        position_ids: &Tensor,
    ) -> crate::Result<Vec<(String, Tensor)>> {
        let mut captured = Vec::with_capacity(TARGET_PROJECTIONS.len());
        self.forward_layer_impl(
            weights,
            hidden,
            attention_mask,
            position_ids,
            &mut CaptureSink(Some(&mut captured)),
        )?;
        Ok(captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            architectures: vec!["LlamaForCausalLM".to_string()],
            hidden_size: 8,
            intermediate_size: 16,
            num_attention_heads: 2,
            num_key_value_heads: None,
            num_hidden_layers: 1,
            rms_norm_eps: 1e-5,
            vocab_size: 32,
            max_position_embeddings: 16,
            rope_theta: 10000.0,
            use_cache: true,
            tie_word_embeddings: false,
        }
    }

    fn tiny_layer(config: &ModelConfig) -> LayerWeights {
        let device = Device::Cpu;
        let h = config.hidden_size;
        let kv = config.num_kv_heads() * config.head_dim();
        let inter = config.intermediate_size;

        let mut tensors = HashMap::new();
        for (name, rows, cols) in [
            ("self_attn.q_proj.weight", h, h),
            ("self_attn.k_proj.weight", kv, h),
            ("self_attn.v_proj.weight", kv, h),
            ("self_attn.o_proj.weight", h, h),
            ("mlp.gate_proj.weight", inter, h),
            ("mlp.up_proj.weight", inter, h),
            ("mlp.down_proj.weight", h, inter),
        ] {
            tensors.insert(
                name.to_string(),
                Tensor::rand(-0.1f32, 0.1, (rows, cols), &device).unwrap(),
            );
        }
        for name in ["input_layernorm.weight", "post_attention_layernorm.weight"] {
            tensors.insert(
                name.to_string(),
                Tensor::ones((h,), DType::F32, &device).unwrap(),
            );
        }

        LayerWeights::new(0, tensors)
    }

    #[test]
    fn test_forward_layer_shape() {
        let config = tiny_config();
        let device = Device::Cpu;
        let adapter = LlamaAdapter::new(&config, &device, DType::F32).unwrap();
        let weights = tiny_layer(&config);

        let hidden = Tensor::rand(-1.0f32, 1.0, (1, 4, 8), &device).unwrap();
        let positions = Tensor::arange(0u32, 4, &device).unwrap().unsqueeze(0).unwrap();

        let output = adapter
            .forward_layer(&weights, &hidden, None, &positions)
            .unwrap();
        assert_eq!(output.dims(), hidden.dims());
        assert_eq!(output.dtype(), hidden.dtype());
    }

    #[test]
    fn test_capture_covers_every_target() {
        let config = tiny_config();
        let device = Device::Cpu;
        let adapter = LlamaAdapter::new(&config, &device, DType::F32).unwrap();
        let weights = tiny_layer(&config);

        let hidden = Tensor::rand(-1.0f32, 1.0, (1, 4, 8), &device).unwrap();
        let positions = Tensor::arange(0u32, 4, &device).unwrap().unsqueeze(0).unwrap();

        let captured = adapter
            .capture_projection_inputs(&weights, &hidden, None, &positions)
            .unwrap();

        let names: Vec<&str> = captured.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, TARGET_PROJECTIONS.to_vec());

        // q/k/v see the normed hidden states; down_proj sees the MLP
        // intermediate width
        assert_eq!(captured[0].1.dims(), &[1, 4, 8]);
        assert_eq!(captured[6].1.dims(), &[1, 4, 16]);
    }

    #[test]
    fn test_causal_mask_blocks_future() {
        let mask = LlamaAdapter::create_causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        let rows: Vec<Vec<f32>> = mask.to_vec2().unwrap();

        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1] < -1e9);
        assert!(rows[1][2] < -1e9);
        assert_eq!(rows[2][0], 0.0);
    }
}
