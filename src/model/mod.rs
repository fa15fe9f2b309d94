//! Model representation and architecture adapters for layerwise compression.

mod auto;
mod base;
mod layerwise;
mod llama;

pub use auto::adapter_for;
pub use base::{LayerNames, ModelAdapter};
pub use layerwise::{DecoderLayer, LayerwiseModel};
pub use llama::LlamaAdapter;
