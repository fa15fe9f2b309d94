//! The sequential compression pipeline.
//!
//! - [`PipelineState`]: typed accumulated state threaded through stages
//! - [`LayerCompressor`]: one layer's capture → solve → forward cycle
//! - [`OneShotCompressor`]: the driver with the three-phase lifecycle
//!   (`initialize` → `run` → `finalize`)

mod driver;
mod layer_compressor;
mod state;

pub use driver::OneShotCompressor;
pub use layer_compressor::LayerCompressor;
pub use state::{FinalizationPayload, PipelineState, StateUpdate};
