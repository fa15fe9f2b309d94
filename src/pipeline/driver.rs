//! The sequential pipeline driver.
//!
//! Owns the model for the duration of a compression job and enforces the
//! three-phase lifecycle: `initialize(model, device)` once, `run(data)`
//! once, `finalize(payload)` afterwards (idempotent). Any stage failure
//! aborts the whole run; there is no partial commit and no retry below the
//! caller.

use indicatif::{ProgressBar, ProgressStyle};

use crate::calibration::CalibrationDataset;
use crate::config::CompressionConfig;
use crate::model::{adapter_for, LayerwiseModel, ModelAdapter};
use crate::solver::{LayerTelemetry, ObsSolver, WeightSolver};
use crate::utils::Device;

use super::{FinalizationPayload, LayerCompressor, PipelineState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Initialized,
    Ran,
    Finalized,
    /// A stage aborted mid-run; the model may be partially compressed and
    /// must be discarded by the caller
    Failed,
}

/// Drives one compression run over a model.
pub struct OneShotCompressor {
    config: CompressionConfig,
    solver: Box<dyn WeightSolver>,
    adapter: Option<Box<dyn ModelAdapter>>,
    model: Option<LayerwiseModel>,
    device: Option<Device>,
    telemetry: Vec<LayerTelemetry>,
    phase: Phase,
}

impl OneShotCompressor {
    /// Create a compressor with the default solver.
    pub fn new(config: CompressionConfig) -> Self {
        Self::with_solver(config, Box::new(ObsSolver::new()))
    }

    /// Create a compressor with a custom solver implementation.
    pub fn with_solver(config: CompressionConfig, solver: Box<dyn WeightSolver>) -> Self {
        Self {
            config,
            solver,
            adapter: None,
            model: None,
            device: None,
            telemetry: Vec::new(),
            phase: Phase::Created,
        }
    }

    /// Take ownership of the model, resolve the architecture adapter, and
    /// attach calibration observers. Must be called exactly once.
    pub fn initialize(&mut self, mut model: LayerwiseModel, device: Device) -> crate::Result<()> {
        if self.phase != Phase::Created {
            return Err(crate::SparseLLMError::pipeline_state(
                "initialize",
                "compressor is already initialized",
            ));
        }

        if self.adapter.is_none() {
            let dtype = model.embed_tokens().dtype();
            self.adapter = Some(adapter_for(model.config(), &device, dtype)?);
        }

        model.enable_calibration_observers();
        self.model = Some(model);
        self.device = Some(device);
        self.phase = Phase::Initialized;

        Ok(())
    }

    /// Run the full pass: bottom → each layer in order → head. Returns the
    /// finalization payload extracted from the accumulated state.
    ///
    /// Compression is all-or-nothing: any stage error aborts the run and
    /// poisons this compressor, so the partially compressed model cannot be
    /// re-run or released. Retry means a fresh compressor and a fresh model.
    pub fn run(&mut self, data: &CalibrationDataset) -> crate::Result<FinalizationPayload> {
        if self.phase != Phase::Initialized {
            return Err(crate::SparseLLMError::pipeline_state(
                "run",
                "run must follow initialize, exactly once",
            ));
        }

        match self.run_stages(data) {
            Ok(payload) => {
                self.phase = Phase::Ran;
                Ok(payload)
            }
            Err(error) => {
                self.phase = Phase::Failed;
                Err(error)
            }
        }
    }

    fn run_stages(&mut self, data: &CalibrationDataset) -> crate::Result<FinalizationPayload> {
        let model = self
            .model
            .as_mut()
            .ok_or_else(|| crate::SparseLLMError::pipeline_state("run", "no model attached"))?;
        let adapter = self
            .adapter
            .as_deref()
            .ok_or_else(|| crate::SparseLLMError::pipeline_state("run", "no adapter resolved"))?;
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| crate::SparseLLMError::pipeline_state("run", "no device resolved"))?;

        let layers = model.get_layers(self.config.compress_layers())?;
        let total = layers.len();

        let mut state = PipelineState::default();

        tracing::info!("Running bottom compressor");
        let update = adapter.bottom_compress(model, device, data, &self.config)?;
        state.merge(update);
        state.require_outputs("bottom")?;

        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} Compressing layers")
                .unwrap(),
        );

        for (step, (name, layer_idx)) in layers.iter().enumerate() {
            let inputs = state.require_outputs(&format!("layer {}", layer_idx))?.clone();

            tracing::info!("Compressing layer {}/{} ({})", step + 1, total, name);
            let compressor = LayerCompressor::new(
                adapter,
                self.solver.as_ref(),
                *layer_idx,
                inputs,
                &self.config,
            );
            let (update, telemetry) = compressor.compress(model, device, &state)?;
            state.merge(update);

            tracing::debug!(
                "Layer {} done: sparsity {:.3}, {} solver passes",
                layer_idx,
                telemetry.achieved_sparsity(),
                telemetry.solver_passes
            );
            self.telemetry.push(telemetry);
            pb.inc(1);
        }
        pb.finish_and_clear();

        if let Some(update) = adapter.head_compress(model, device, &state, self.solver.as_ref(), &self.config)? {
            state.merge(update);
        }

        let payload = FinalizationPayload {
            use_cache: state.use_cache.unwrap_or(false),
        };

        let params_total: usize = self.telemetry.iter().map(|t| t.params_total).sum();
        let params_pruned: usize = self.telemetry.iter().map(|t| t.params_pruned).sum();
        tracing::info!(
            "Compressed {} layers: {}/{} weights pruned ({:.1}%)",
            total,
            params_pruned,
            params_total,
            100.0 * params_pruned as f64 / params_total.max(1) as f64
        );

        Ok(payload)
    }

    /// Restore model-wide runtime flags. Idempotent after a completed run;
    /// calling it before the run completes is a state error (observers are
    /// still needed by later layers).
    pub fn finalize(&mut self, payload: &FinalizationPayload) -> crate::Result<()> {
        match self.phase {
            Phase::Created | Phase::Initialized => Err(crate::SparseLLMError::pipeline_state(
                "finalize",
                "finalize must follow a completed run",
            )),
            Phase::Failed => Err(crate::SparseLLMError::pipeline_state(
                "finalize",
                "run aborted; discard the model and retry from the top",
            )),
            Phase::Ran | Phase::Finalized => {
                let model = self.model.as_mut().ok_or_else(|| {
                    crate::SparseLLMError::pipeline_state("finalize", "no model attached")
                })?;

                model.disable_calibration_observers();
                model.set_use_cache(payload.use_cache);
                self.phase = Phase::Finalized;

                Ok(())
            }
        }
    }

    /// Per-layer solver telemetry accumulated during `run`.
    pub fn telemetry(&self) -> &[LayerTelemetry] {
        &self.telemetry
    }

    /// Release the compressed model after finalization.
    pub fn into_model(self) -> crate::Result<LayerwiseModel> {
        if self.phase != Phase::Finalized {
            return Err(crate::SparseLLMError::pipeline_state(
                "into_model",
                "model is released only after finalize",
            ));
        }
        self.model.ok_or_else(|| {
            crate::SparseLLMError::pipeline_state("into_model", "no model attached")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::pipeline::StateUpdate;
    use crate::solver::{SolveTarget, SolverArgs};
    use candle_core::{DType, Tensor};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn tiny_config(num_layers: usize) -> ModelConfig {
        ModelConfig {
            architectures: vec!["LlamaForCausalLM".to_string()],
            hidden_size: 8,
            intermediate_size: 16,
            num_attention_heads: 2,
            num_key_value_heads: None,
            num_hidden_layers: num_layers,
            rms_norm_eps: 1e-5,
            vocab_size: 32,
            max_position_embeddings: 16,
            rope_theta: 10000.0,
            use_cache: true,
            tie_word_embeddings: false,
        }
    }

    fn tiny_layer_tensors(config: &ModelConfig) -> HashMap<String, Tensor> {
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
        tensors
    }

    fn tiny_model(num_layers: usize, with_head: bool) -> LayerwiseModel {
        let config = tiny_config(num_layers);
        let device = Device::Cpu;
        let embed = Tensor::rand(-0.1f32, 0.1, (config.vocab_size, config.hidden_size), &device)
            .unwrap();
        let norm = Tensor::ones((config.hidden_size,), DType::F32, &device).unwrap();
        let head = with_head.then(|| {
            Tensor::rand(-0.1f32, 0.1, (config.vocab_size, config.hidden_size), &device).unwrap()
        });
        let layers = (0..num_layers).map(|_| tiny_layer_tensors(&config)).collect();
        LayerwiseModel::from_parts(config, embed, layers, norm, head)
    }

    fn tiny_dataset() -> CalibrationDataset {
        CalibrationDataset::from_token_batches(vec![vec![1, 5, 9, 2], vec![3, 3, 7, 1]]).unwrap()
    }

    fn run_config(sparsity: f32, sequential: bool) -> CompressionConfig {
        CompressionConfig::builder()
            .sparsity(sparsity)
            .block_size(4)
            .sequential_update(sequential)
            .build()
            .unwrap()
    }

    #[test]
    fn test_three_layer_sequential_run() {
        let mut compressor = OneShotCompressor::new(run_config(0.5, true));
        compressor
            .initialize(tiny_model(3, true), Device::Cpu)
            .unwrap();

        let payload = compressor.run(&tiny_dataset()).unwrap();

        // Layers compressed in architectural order, one telemetry each
        let telemetry = compressor.telemetry();
        assert_eq!(telemetry.len(), 3);
        for (idx, layer_telemetry) in telemetry.iter().enumerate() {
            assert_eq!(layer_telemetry.layer_idx, idx);
            // Sequential mode: one solver pass per target projection
            assert_eq!(layer_telemetry.solver_passes, 7);
            assert!((layer_telemetry.achieved_sparsity() - 0.5).abs() < 0.05);
        }

        // The captured cache flag survives into the payload
        assert!(payload.use_cache);

        compressor.finalize(&payload).unwrap();
        let model = compressor.into_model().unwrap();
        assert!(model.use_cache());
        assert!(!model.observers_enabled());
    }

    #[test]
    fn test_batched_mode_single_pass_per_layer() {
        let mut compressor = OneShotCompressor::new(run_config(0.5, false));
        compressor
            .initialize(tiny_model(2, false), Device::Cpu)
            .unwrap();
        compressor.run(&tiny_dataset()).unwrap();

        for layer_telemetry in compressor.telemetry() {
            assert_eq!(layer_telemetry.solver_passes, 1);
        }
    }

    /// Bottom compressor that violates the contract by omitting `outputs`.
    struct BrokenBottomAdapter(crate::model::LlamaAdapter);

    impl ModelAdapter for BrokenBottomAdapter {
        fn layer_names(&self) -> &crate::model::LayerNames {
            self.0.layer_names()
        }
        fn target_projections(&self) -> &[&'static str] {
            self.0.target_projections()
        }
        fn bottom_compress(
            &self,
            _model: &mut LayerwiseModel,
            _device: &Device,
            _data: &CalibrationDataset,
            _config: &CompressionConfig,
        ) -> crate::Result<StateUpdate> {
            Ok(StateUpdate {
                use_cache: Some(false),
                ..Default::default()
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
            self.0.head_compress(model, device, state, solver, config)
        }
        fn forward_layer(
            &self,
            weights: &crate::layers::LayerWeights,
            hidden: &Tensor,
            attention_mask: Option<&Tensor>,
            position_ids: &Tensor,
        ) -> crate::Result<Tensor> {
            self.0
                .forward_layer(weights, hidden, attention_mask, position_ids)
        }
        fn capture_projection_inputs(
            &self,
            weights: &crate::layers::LayerWeights,
            hidden: &Tensor,
            attention_mask: Option<&Tensor>,
            position_ids: &Tensor,
        ) -> crate::Result<Vec<(String, Tensor)>> {
            self.0
                .capture_projection_inputs(weights, hidden, attention_mask, position_ids)
        }
    }

    #[test]
    fn test_missing_bottom_outputs_aborts_run() {
        let model = tiny_model(3, false);
        let inner =
            crate::model::LlamaAdapter::new(model.config(), &Device::Cpu, DType::F32).unwrap();

        let mut compressor = OneShotCompressor::with_solver(
            run_config(0.5, true),
            Box::new(crate::solver::ObsSolver::new()),
        );
        compressor.adapter = Some(Box::new(BrokenBottomAdapter(inner)));
        compressor.initialize(model, Device::Cpu).unwrap();

        let err = compressor.run(&tiny_dataset()).unwrap_err();
        assert!(matches!(
            err,
            crate::SparseLLMError::PipelineState { ref stage, .. } if stage == "bottom"
        ));

        // The failed run poisons the compressor: no finalize, no release
        let payload = FinalizationPayload { use_cache: false };
        assert!(compressor.finalize(&payload).is_err());
        assert!(compressor.into_model().is_err());
    }

    /// Solver that records which layer index each kernel call targeted.
    struct RecordingSolver {
        calls: Mutex<Vec<usize>>,
    }

    impl WeightSolver for RecordingSolver {
        fn compress_layer(
            &self,
            layer_idx: usize,
            targets: &mut [SolveTarget],
            _args: &SolverArgs,
        ) -> crate::Result<LayerTelemetry> {
            self.calls.lock().unwrap().push(layer_idx);
            let mut telemetry = LayerTelemetry::new(layer_idx);
            telemetry.solver_passes = targets.len();
            Ok(telemetry)
        }
    }

    #[test]
    fn test_layers_solved_in_architectural_order() {
        let mut compressor = OneShotCompressor::with_solver(
            run_config(0.5, true),
            Box::new(RecordingSolver {
                calls: Mutex::new(Vec::new()),
            }),
        );
        compressor
            .initialize(tiny_model(3, false), Device::Cpu)
            .unwrap();
        compressor.run(&tiny_dataset()).unwrap();

        // Downcast via telemetry: layer order must be strictly 0, 1, 2
        let order: Vec<usize> = compressor.telemetry().iter().map(|t| t.layer_idx).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_lifecycle_order_enforced() {
        let mut compressor = OneShotCompressor::new(run_config(0.5, true));

        // run before initialize
        assert!(compressor.run(&tiny_dataset()).is_err());

        compressor
            .initialize(tiny_model(1, false), Device::Cpu)
            .unwrap();

        // finalize before run
        let premature = FinalizationPayload { use_cache: true };
        assert!(compressor.finalize(&premature).is_err());

        // double initialize
        let mut other = OneShotCompressor::new(run_config(0.5, true));
        other.initialize(tiny_model(1, false), Device::Cpu).unwrap();
        assert!(other.initialize(tiny_model(1, false), Device::Cpu).is_err());
    }

    #[test]
    fn test_finalize_idempotent() {
        let mut compressor = OneShotCompressor::new(run_config(0.5, true));
        compressor
            .initialize(tiny_model(1, false), Device::Cpu)
            .unwrap();
        let payload = compressor.run(&tiny_dataset()).unwrap();

        compressor.finalize(&payload).unwrap();
        let after_first = compressor.model.as_ref().unwrap().use_cache();

        compressor.finalize(&payload).unwrap();
        let after_second = compressor.model.as_ref().unwrap().use_cache();

        assert_eq!(after_first, after_second);
        assert!(!compressor.model.as_ref().unwrap().observers_enabled());
    }
}
