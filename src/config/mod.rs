//! Configuration module for model metadata and per-run compression settings.

mod compress_config;
mod model_config;

pub use compress_config::{CompressionConfig, CompressionConfigBuilder};
pub use model_config::{ModelArchitecture, ModelConfig, WeightStorage};
