//! Per-run compression arguments.
//!
//! A `CompressionConfig` is immutable once built: every parameter is
//! validated in `build()` and there is no mutation API. Changing a run's
//! parameters means constructing a new config.

use serde::Serialize;

use super::WeightStorage;
use crate::solver::SolverArgs;

/// Immutable configuration for one compression run. Every instance has
/// passed `build()` validation; there is no `Deserialize` path around it.
#[derive(Debug, Clone, Serialize)]
pub struct CompressionConfig {
    sparsity: f32,
    prunen: usize,
    prunem: usize,
    block_size: usize,
    dampening_frac: f32,
    sequential_update: bool,
    quantize: bool,
    compress_layers: String,
    storage: WeightStorage,
}

impl CompressionConfig {
    /// Start building a configuration with default parameters.
    pub fn builder() -> CompressionConfigBuilder {
        CompressionConfigBuilder::default()
    }

    /// Target fraction of weights set to zero (0.0..1.0)
    pub fn sparsity(&self) -> f32 {
        self.sparsity
    }

    /// `n` of an n:m structured pattern (0 = unstructured)
    pub fn prunen(&self) -> usize {
        self.prunen
    }

    /// `m` of an n:m structured pattern
    pub fn prunem(&self) -> usize {
        self.prunem
    }

    /// Column block size for the solver and quantizer
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Fraction of the mean Hessian diagonal added for numerical stability
    pub fn dampening_frac(&self) -> f32 {
        self.dampening_frac
    }

    /// One solver pass per projection (true) vs one joint pass per layer
    pub fn sequential_update(&self) -> bool {
        self.sequential_update
    }

    /// Quantize surviving weights after pruning
    pub fn quantize(&self) -> bool {
        self.quantize
    }

    /// Name prefix selecting the compressible layers
    pub fn compress_layers(&self) -> &str {
        &self.compress_layers
    }

    /// On-disk format for the compressed checkpoint
    pub fn storage(&self) -> WeightStorage {
        self.storage
    }

    /// The subset of parameters the solver consumes.
    pub fn solver_args(&self) -> SolverArgs {
        SolverArgs {
            sparsity: self.sparsity,
            prunen: self.prunen,
            prunem: self.prunem,
            block_size: self.block_size,
            dampening_frac: self.dampening_frac,
            sequential_update: self.sequential_update,
            quantize: self.quantize,
        }
    }
}

/// Builder for [`CompressionConfig`]
#[derive(Debug, Clone)]
pub struct CompressionConfigBuilder {
    sparsity: f32,
    prunen: usize,
    prunem: usize,
    block_size: usize,
    dampening_frac: f32,
    sequential_update: bool,
    quantize: bool,
    compress_layers: String,
    storage: WeightStorage,
}

impl Default for CompressionConfigBuilder {
    fn default() -> Self {
        Self {
            sparsity: 0.5,
            prunen: 0,
            prunem: 0,
            block_size: 128,
            dampening_frac: 0.01,
            sequential_update: true,
            quantize: false,
            compress_layers: "model.layers".to_string(),
            storage: WeightStorage::Dense,
        }
    }
}

impl CompressionConfigBuilder {
    pub fn sparsity(mut self, sparsity: f32) -> Self {
        self.sparsity = sparsity;
        self
    }

    /// Request an n:m structured pattern (n zeros in every m columns).
    pub fn structured(mut self, prunen: usize, prunem: usize) -> Self {
        self.prunen = prunen;
        self.prunem = prunem;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn dampening_frac(mut self, frac: f32) -> Self {
        self.dampening_frac = frac;
        self
    }

    pub fn sequential_update(mut self, sequential: bool) -> Self {
        self.sequential_update = sequential;
        self
    }

    pub fn quantize(mut self, quantize: bool) -> Self {
        self.quantize = quantize;
        self
    }

    pub fn compress_layers(mut self, selector: impl Into<String>) -> Self {
        self.compress_layers = selector.into();
        self
    }

    pub fn storage(mut self, storage: WeightStorage) -> Self {
        self.storage = storage;
        self
    }

    /// Validate all parameters and produce the immutable config.
    pub fn build(self) -> crate::Result<CompressionConfig> {
        if !(0.0..1.0).contains(&self.sparsity) {
            return Err(crate::SparseLLMError::Configuration(format!(
                "sparsity must be in [0.0, 1.0), got {}",
                self.sparsity
            )));
        }
        if self.prunen > 0 {
            if self.prunem == 0 {
                return Err(crate::SparseLLMError::Configuration(
                    "prunem must be set when prunen is set".to_string(),
                ));
            }
            if self.prunen > self.prunem {
                return Err(crate::SparseLLMError::Configuration(format!(
                    "invalid structured pattern {}:{} (n must not exceed m)",
                    self.prunen, self.prunem
                )));
            }
        }
        if self.block_size == 0 {
            return Err(crate::SparseLLMError::Configuration(
                "block_size must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.dampening_frac) || self.dampening_frac == 0.0 {
            return Err(crate::SparseLLMError::Configuration(format!(
                "dampening_frac must be in (0.0, 1.0), got {}",
                self.dampening_frac
            )));
        }
        if self.compress_layers.is_empty() {
            return Err(crate::SparseLLMError::Configuration(
                "compress_layers selector must not be empty".to_string(),
            ));
        }

        Ok(CompressionConfig {
            sparsity: self.sparsity,
            prunen: self.prunen,
            prunem: self.prunem,
            block_size: self.block_size,
            dampening_frac: self.dampening_frac,
            sequential_update: self.sequential_update,
            quantize: self.quantize,
            compress_layers: self.compress_layers,
            storage: self.storage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_build() {
        let config = CompressionConfig::builder().build().unwrap();
        assert_eq!(config.sparsity(), 0.5);
        assert!(config.sequential_update());
        assert!(!config.quantize());
        assert_eq!(config.compress_layers(), "model.layers");
    }

    #[test]
    fn test_sparsity_out_of_range() {
        assert!(CompressionConfig::builder().sparsity(1.0).build().is_err());
        assert!(CompressionConfig::builder().sparsity(-0.1).build().is_err());
    }

    #[test]
    fn test_invalid_structured_pattern() {
        assert!(CompressionConfig::builder().structured(4, 2).build().is_err());
        assert!(CompressionConfig::builder().structured(2, 0).build().is_err());
        assert!(CompressionConfig::builder().structured(2, 4).build().is_ok());
    }

    #[test]
    fn test_invalid_dampening() {
        assert!(CompressionConfig::builder().dampening_frac(0.0).build().is_err());
        assert!(CompressionConfig::builder().dampening_frac(1.0).build().is_err());
    }

    #[test]
    fn test_solver_args_subset() {
        let config = CompressionConfig::builder()
            .sparsity(0.75)
            .block_size(64)
            .sequential_update(false)
            .build()
            .unwrap();
        let args = config.solver_args();
        assert_eq!(args.sparsity, 0.75);
        assert_eq!(args.block_size, 64);
        assert!(!args.sequential_update);
    }
}
