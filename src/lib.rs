//! # rs-sparsellm
//!
//! One-shot layerwise compression for transformer checkpoints: sparsify and
//! quantize a model's decoder layers using a small calibration dataset,
//! without any retraining.
//!
//! ## Core Concept
//!
//! Compression runs strictly layer by layer:
//! - **Bottom stage**: push calibration data through the embedding, capturing
//!   the inputs to the first decoder layer
//! - **Layer loop**: for each layer in architectural order, solve for sparse
//!   (optionally quantized) weights against the captured activations, then
//!   run one true forward pass so the next layer sees real outputs
//! - **Head stage**: compress a trailing lm-head against the final activations
//! - **Finalize**: detach calibration observers and restore runtime flags
//!
//! ## Example
//!
//! ```ignore
//! use rs_sparsellm::{CompressionConfig, LayerwiseModel, OneShotCompressor};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = CompressionConfig::builder().sparsity(0.5).build()?;
//!     let model = LayerwiseModel::load("models/llama-7b", candle_core::DType::F32)?;
//!     let device = rs_sparsellm::utils::get_device(None)?;
//!
//!     let mut compressor = OneShotCompressor::new(config);
//!     compressor.initialize(model, device)?;
//!     // let payload = compressor.run(&dataset)?;
//!     // compressor.finalize(&payload)?;
//!     Ok(())
//! }
//! ```

pub mod calibration;
pub mod config;
pub mod distillation;
pub mod layers;
pub mod model;
pub mod pipeline;
pub mod quantization;
pub mod solver;
pub mod utils;

// Re-exports for convenience
pub use calibration::{CalibrationBatch, CalibrationDataset};
pub use config::{CompressionConfig, ModelConfig, WeightStorage};
pub use distillation::{DistillationConfig, DistillationTeacher, PerLayerDistillation};
pub use model::{LayerwiseModel, ModelAdapter};
pub use pipeline::{FinalizationPayload, OneShotCompressor, PipelineState};
pub use quantization::{Int8Quantizer, Nf4Quantizer, QuantizedTensor};
pub use solver::{ObsSolver, SolverArgs, WeightSolver};
pub use utils::{get_device, DType, Device};

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum SparseLLMError {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Unsupported model architecture: {0}")]
    UnsupportedArchitecture(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Pipeline state error in stage '{stage}': {message}")]
    PipelineState { stage: String, message: String },

    #[error("Solver failure at layer {layer}: {message}")]
    Solver { layer: usize, message: String },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Layer load failed: {0}")]
    LayerLoad(String),

    #[error("Quantization error: {0}")]
    Quantization(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SparseLLMError {
    /// Required inter-stage state was missing or a lifecycle call arrived
    /// out of order.
    pub fn pipeline_state(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PipelineState {
            stage: stage.into(),
            message: message.into(),
        }
    }

    pub fn solver(layer: usize, message: impl Into<String>) -> Self {
        Self::Solver {
            layer,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SparseLLMError>;
