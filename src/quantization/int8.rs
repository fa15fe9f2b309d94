//! 8-bit blockwise quantization.
//!
//! Symmetric 8-bit quantization with per-block scaling factors. Because the
//! scheme is symmetric, a zero weight quantizes to exactly zero, which keeps
//! solver-pruned positions sparse through a quantize-dequantize round trip.

use candle_core::{DType, Device, Tensor};

use super::{tensor::QuantType, QuantizedTensor, Quantizer};

/// Int8 blockwise quantizer
pub struct Int8Quantizer {
    /// Block size for quantization
    block_size: usize,
}

impl Int8Quantizer {
    /// Create a new Int8 quantizer with default block size
    pub fn new() -> Self {
        Self { block_size: 64 }
    }

    /// Create with custom block size
    pub fn with_block_size(block_size: usize) -> Self {
        assert!(block_size > 0, "Block size must be positive");
        Self { block_size }
    }
}

impl Default for Int8Quantizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Quantizer for Int8Quantizer {
    fn quantize(&self, tensor: &Tensor) -> crate::Result<QuantizedTensor> {
        let shape: Vec<usize> = tensor.dims().to_vec();
        let source_dtype = tensor.dtype();
        let flat = tensor.flatten_all()?.to_dtype(DType::F32)?;
        let data: Vec<f32> = flat.to_vec1()?;

        let mut scales = Vec::with_capacity(data.len().div_ceil(self.block_size));
        let mut quantized_data = Vec::with_capacity(data.len());

        for block in data.chunks(self.block_size) {
            // Symmetric int8 range is -127..=127; guard the degenerate
            // all-zero block against a zero divisor
            let absmax = block
                .iter()
                .map(|x| x.abs())
                .fold(0.0f32, f32::max)
                .max(1e-10);
            let scale = absmax / 127.0;
            scales.push(scale);

            for &val in block {
                let quantized = (val / scale).round().clamp(-127.0, 127.0) as i8;
                quantized_data.push(quantized as u8);
            }
        }

        Ok(QuantizedTensor::new(
            quantized_data,
            scales,
            shape,
            source_dtype,
            self.block_size,
            QuantType::Int8,
        ))
    }

    fn dequantize(&self, quantized: &QuantizedTensor) -> crate::Result<Tensor> {
        if quantized.quant_type != QuantType::Int8 {
            return Err(crate::SparseLLMError::Quantization(
                "blob is not int8-quantized".to_string(),
            ));
        }

        let numel = quantized.numel();
        let mut output = Vec::with_capacity(numel);

        for (block, scale) in quantized
            .data
            .chunks(quantized.block_size)
            .zip(quantized.scales.iter())
        {
            for &byte in block {
                output.push((byte as i8) as f32 * scale);
            }
        }
        output.truncate(numel);

        let tensor = Tensor::from_vec(output, quantized.shape.as_slice(), &Device::Cpu)?;
        tensor.to_dtype(quantized.dtype).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int8_roundtrip() {
        let quantizer = Int8Quantizer::new();

        let data = vec![0.1f32, -0.5, 0.8, -0.2, 0.0, 0.3, -0.7, 0.9];
        let tensor = Tensor::from_vec(data.clone(), &[8], &Device::Cpu).unwrap();

        let quantized = quantizer.quantize(&tensor).unwrap();
        let restored = quantizer.dequantize(&quantized).unwrap();

        assert_eq!(restored.dims(), tensor.dims());
        assert_eq!(restored.dtype(), tensor.dtype());

        let restored_data: Vec<f32> = restored.to_vec1().unwrap();
        for (orig, rest) in data.iter().zip(restored_data.iter()) {
            let error = (orig - rest).abs();
            assert!(
                error < 0.02,
                "Error too large: {} vs {} (diff: {})",
                orig,
                rest,
                error
            );
        }
    }

    #[test]
    fn test_zero_preserved_exactly() {
        let quantizer = Int8Quantizer::with_block_size(4);

        // Pruned weights interleaved with live ones
        let data = vec![0.0f32, 0.6, 0.0, -0.4, 0.0, 0.0, 1.2, 0.0];
        let tensor = Tensor::from_vec(data.clone(), &[8], &Device::Cpu).unwrap();

        let restored = quantizer
            .dequantize(&quantizer.quantize(&tensor).unwrap())
            .unwrap();
        let restored_data: Vec<f32> = restored.to_vec1().unwrap();

        for (orig, rest) in data.iter().zip(restored_data.iter()) {
            if *orig == 0.0 {
                assert_eq!(*rest, 0.0, "zero weight must survive quantization");
            }
        }
    }

    #[test]
    fn test_int8_compression_ratio() {
        let quantizer = Int8Quantizer::new();

        let data: Vec<f32> = (0..1024).map(|i| (i as f32) / 1024.0 - 0.5).collect();
        let tensor = Tensor::from_vec(data, &[1024], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();

        let quantized = quantizer.quantize(&tensor).unwrap();

        // 1 byte per element vs 2 bytes f16, plus one f32 scale per 64 elements
        let ratio = quantized.compression_ratio();
        assert!(ratio < 0.55, "Compression ratio should be ~0.5, got {}", ratio);
    }
}
