//! 4-bit NormalFloat (NF4) quantization.
//!
//! NF4 levels are optimally spaced for normally distributed weights, which
//! makes it a good storage format for compressed checkpoints.
//!
//! Reference: QLoRA paper (https://arxiv.org/abs/2305.14314)

use candle_core::{DType, Device, Tensor};

use super::{tensor::QuantType, QuantizedTensor, Quantizer};

/// The 16 NF4 quantization levels (normalized to [-1, 1])
const NF4_QUANT_LEVELS: [f32; 16] = [
    -1.0,
    -0.6961928009986877,
    -0.5250730514526367,
    -0.39491748809814453,
    -0.28444138169288635,
    -0.18477343022823334,
    -0.09105003625154495,
    0.0,
    0.07958029955625534,
    0.16093020141124725,
    0.24611230194568634,
    0.33791524171829224,
    0.44070982933044434,
    0.5626170039176941,
    0.7229568362236023,
    1.0,
];

/// NF4 quantizer for 4-bit weight storage
pub struct Nf4Quantizer {
    /// Block size for quantization (number of elements per scale)
    block_size: usize,
}

impl Nf4Quantizer {
    /// Create a new NF4 quantizer with default block size
    pub fn new() -> Self {
        Self { block_size: 64 }
    }

    /// Create with custom block size
    pub fn with_block_size(block_size: usize) -> Self {
        assert!(
            block_size > 0 && block_size % 2 == 0,
            "Block size must be positive and even"
        );
        Self { block_size }
    }

    /// Find the closest NF4 level index for a normalized value
    fn quantize_value(normalized: f32) -> u8 {
        let mut best_idx = 0u8;
        let mut best_dist = f32::MAX;

        for (i, &level) in NF4_QUANT_LEVELS.iter().enumerate() {
            let dist = (normalized - level).abs();
            if dist < best_dist {
                best_dist = dist;
                best_idx = i as u8;
            }
        }

        best_idx
    }

    fn pack_nibbles(high: u8, low: u8) -> u8 {
        ((high & 0x0F) << 4) | (low & 0x0F)
    }

    fn unpack_nibbles(byte: u8) -> (u8, u8) {
        ((byte >> 4) & 0x0F, byte & 0x0F)
    }
}

impl Default for Nf4Quantizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Quantizer for Nf4Quantizer {
    fn quantize(&self, tensor: &Tensor) -> crate::Result<QuantizedTensor> {
        let shape: Vec<usize> = tensor.dims().to_vec();
        let source_dtype = tensor.dtype();
        let flat = tensor.flatten_all()?.to_dtype(DType::F32)?;
        let data: Vec<f32> = flat.to_vec1()?;
        let numel = data.len();

        let mut scales = Vec::with_capacity(numel.div_ceil(self.block_size));
        let mut quantized_data = Vec::with_capacity(numel.div_ceil(2));

        for block in data.chunks(self.block_size) {
            let absmax = block
                .iter()
                .map(|x| x.abs())
                .fold(0.0f32, f32::max)
                .max(1e-10);
            scales.push(absmax);

            let mut pending: Option<u8> = None;
            for &val in block {
                let idx = Self::quantize_value(val / absmax);
                match pending.take() {
                    Some(prev) => quantized_data.push(Self::pack_nibbles(prev, idx)),
                    None => pending = Some(idx),
                }
            }
            // Odd block tail is padded with a zero nibble
            if let Some(last) = pending {
                quantized_data.push(Self::pack_nibbles(last, 0));
            }
        }

        Ok(QuantizedTensor::new(
            quantized_data,
            scales,
            shape,
            source_dtype,
            self.block_size,
            QuantType::Nf4,
        ))
    }

    fn dequantize(&self, quantized: &QuantizedTensor) -> crate::Result<Tensor> {
        if quantized.quant_type != QuantType::Nf4 {
            return Err(crate::SparseLLMError::Quantization(
                "blob is not nf4-quantized".to_string(),
            ));
        }

        let numel = quantized.numel();
        let block_size = quantized.block_size;
        let mut output = Vec::with_capacity(numel);

        // Each block owns ceil(block_size / 2) packed bytes
        let bytes_per_block = block_size.div_ceil(2);

        for (block_idx, block_bytes) in quantized.data.chunks(bytes_per_block).enumerate() {
            let scale = *quantized.scales.get(block_idx).ok_or_else(|| {
                crate::SparseLLMError::Quantization("missing block scale".to_string())
            })?;

            let mut in_block = 0;
            for &byte in block_bytes {
                let (high, low) = Self::unpack_nibbles(byte);
                for nibble in [high, low] {
                    if in_block < block_size && output.len() < numel {
                        output.push(NF4_QUANT_LEVELS[nibble as usize] * scale);
                        in_block += 1;
                    }
                }
            }
        }

        if output.len() != numel {
            return Err(crate::SparseLLMError::Quantization(format!(
                "nf4 blob decoded {} values, expected {}",
                output.len(),
                numel
            )));
        }

        let tensor = Tensor::from_vec(output, quantized.shape.as_slice(), &Device::Cpu)?;
        tensor.to_dtype(quantized.dtype).map_err(Into::into)
    }
}
