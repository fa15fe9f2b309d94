//! One-shot weight-compression solver.
//!
//! The pipeline treats the per-module kernel as an opaque numerical
//! primitive behind the [`WeightSolver`] trait: it receives a projection's
//! weight matrix plus accumulated calibration statistics and replaces the
//! weight with a sparsified (optionally quantized) version. Whether a layer
//! is solved one projection at a time or in one joint pass is a solver mode
//! (`sequential_update`), never a pipeline branch.

mod obs;

pub use obs::ObsSolver;

use candle_core::{DType, Tensor, D};

/// Parameters consumed by the solver, fixed for a whole run.
#[derive(Debug, Clone, Copy)]
pub struct SolverArgs {
    /// Target fraction of zeros (0.0..1.0)
    pub sparsity: f32,
    /// `n` of an n:m structured pattern (0 = unstructured)
    pub prunen: usize,
    /// `m` of an n:m structured pattern
    pub prunem: usize,
    /// Column block size for mask selection and quantization
    pub block_size: usize,
    /// Fraction of the mean Hessian diagonal added as damping
    pub dampening_frac: f32,
    /// One kernel pass per projection vs one joint pass per layer
    pub sequential_update: bool,
    /// Quantize surviving weights after pruning
    pub quantize: bool,
}

/// Running per-feature second moment of a projection's inputs.
///
/// This is the diagonal of the calibration Hessian `E[x xᵀ]`, accumulated
/// in f64 across batches so late batches do not drown in rounding error.
#[derive(Debug, Clone)]
pub struct InputStats {
    mean_sq: Vec<f64>,
    tokens: usize,
}

impl InputStats {
    pub fn new(dim: usize) -> Self {
        Self {
            mean_sq: vec![0.0; dim],
            tokens: 0,
        }
    }

    pub fn dim(&self) -> usize {
        self.mean_sq.len()
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }

    /// Diagonal entries, damped by `dampening_frac` of their mean.
    pub fn damped_diag(&self, dampening_frac: f32) -> Vec<f64> {
        let mean = self.mean_sq.iter().sum::<f64>() / self.mean_sq.len().max(1) as f64;
        let damp = dampening_frac as f64 * mean;
        self.mean_sq.iter().map(|&h| h + damp).collect()
    }

    /// Fold one activation tensor (`[..., dim]`) into the running moment.
    pub fn update(&mut self, activations: &Tensor) -> crate::Result<()> {
        let features = activations.dim(D::Minus1)?;
        if features != self.dim() {
            return Err(crate::SparseLLMError::Calibration(format!(
                "activation feature dim {} does not match accumulated dim {}",
                features,
                self.dim()
            )));
        }

        let rows = activations.elem_count() / features;
        let batch_mean: Vec<f32> = activations
            .reshape((rows, features))?
            .to_dtype(DType::F32)?
            .sqr()?
            .mean(0)?
            .to_vec1()?;

        let total = self.tokens + rows;
        for (acc, bm) in self.mean_sq.iter_mut().zip(batch_mean) {
            *acc = (*acc * self.tokens as f64 + bm as f64 * rows as f64) / total as f64;
        }
        self.tokens = total;

        Ok(())
    }
}

/// One projection to be compressed: its weight and calibration statistics.
#[derive(Debug)]
pub struct SolveTarget {
    /// Projection name within the layer (e.g. `self_attn.q_proj`)
    pub name: String,
    /// `[out_features, in_features]` weight, replaced in place by the solver
    pub weight: Tensor,
    /// Accumulated input statistics for this projection
    pub stats: InputStats,
}

/// Per-layer solver telemetry.
#[derive(Debug, Clone)]
pub struct LayerTelemetry {
    pub layer_idx: usize,
    /// Kernel invocations for this layer (targets in sequential mode, 1 in batched)
    pub solver_passes: usize,
    pub params_total: usize,
    pub params_pruned: usize,
    /// Sum of pruned saliencies, a proxy for reconstruction error
    pub error_estimate: f64,
}

impl LayerTelemetry {
    pub fn new(layer_idx: usize) -> Self {
        Self {
            layer_idx,
            solver_passes: 0,
            params_total: 0,
            params_pruned: 0,
            error_estimate: 0.0,
        }
    }

    pub fn achieved_sparsity(&self) -> f32 {
        if self.params_total == 0 {
            0.0
        } else {
            self.params_pruned as f32 / self.params_total as f32
        }
    }
}

/// The one-shot compression primitive.
pub trait WeightSolver: Send + Sync {
    /// Compress every target of one layer. Implementations must honor
    /// `args.sequential_update` internally: one kernel pass per target when
    /// set, a single joint pass over all targets otherwise.
    fn compress_layer(
        &self,
        layer_idx: usize,
        targets: &mut [SolveTarget],
        args: &SolverArgs,
    ) -> crate::Result<LayerTelemetry>;
}
