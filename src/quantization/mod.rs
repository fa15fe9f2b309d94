//! Blockwise quantization for 4-bit and 8-bit weight storage.
//!
//! Two users inside the pipeline:
//! - the solver's quantize step (Int8 quantize-dequantize of surviving
//!   weights after pruning; symmetric, so pruned zeros stay exactly zero)
//! - the checkpoint writer's storage formats (Int8 or NF4 blobs on disk)

mod int8;
mod nf4;
mod tensor;

pub use int8::Int8Quantizer;
pub use nf4::Nf4Quantizer;
pub use tensor::{QuantType, QuantizedTensor};

use crate::config::WeightStorage;

/// Trait for quantization implementations
pub trait Quantizer: Send + Sync {
    /// Quantize a tensor to compressed format
    fn quantize(&self, tensor: &candle_core::Tensor) -> crate::Result<QuantizedTensor>;

    /// Dequantize back to full precision
    fn dequantize(&self, quantized: &QuantizedTensor) -> crate::Result<candle_core::Tensor>;
}

/// Create a quantizer for a storage format, or None for dense storage
pub fn create_quantizer(storage: WeightStorage, block_size: usize) -> Option<Box<dyn Quantizer>> {
    match storage {
        WeightStorage::Dense => None,
        WeightStorage::Nf4 => Some(Box::new(Nf4Quantizer::with_block_size(block_size))),
        WeightStorage::Int8 => Some(Box::new(Int8Quantizer::with_block_size(block_size))),
    }
}
