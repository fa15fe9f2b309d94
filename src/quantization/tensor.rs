//! Quantized tensor representation.

use candle_core::DType;
use serde::{Deserialize, Serialize};

/// A quantized tensor that stores compressed weights.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    /// Compressed data bytes
    pub data: Vec<u8>,

    /// Quantization scale factors (per block)
    pub scales: Vec<f32>,

    /// Original tensor shape
    pub shape: Vec<usize>,

    /// Dtype of the source tensor, restored on dequantize
    pub dtype: DType,

    /// Block size used for quantization
    pub block_size: usize,

    /// Quantization type
    pub quant_type: QuantType,
}

/// Type of quantization applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuantType {
    /// 4-bit NormalFloat (NF4)
    Nf4,
    /// 8-bit integer
    Int8,
}

fn dtype_tag(dtype: DType) -> u8 {
    match dtype {
        DType::F16 => 0,
        DType::BF16 => 1,
        DType::F32 => 2,
        _ => 2,
    }
}

fn dtype_from_tag(tag: u8) -> crate::Result<DType> {
    match tag {
        0 => Ok(DType::F16),
        1 => Ok(DType::BF16),
        2 => Ok(DType::F32),
        other => Err(crate::SparseLLMError::Quantization(format!(
            "invalid dtype tag {}",
            other
        ))),
    }
}

impl QuantizedTensor {
    pub fn new(
        data: Vec<u8>,
        scales: Vec<f32>,
        shape: Vec<usize>,
        dtype: DType,
        block_size: usize,
        quant_type: QuantType,
    ) -> Self {
        Self {
            data,
            scales,
            shape,
            dtype,
            block_size,
            quant_type,
        }
    }

    /// Get the number of elements in the original tensor
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Get compressed size in bytes
    pub fn compressed_size(&self) -> usize {
        self.data.len() + self.scales.len() * 4
    }

    /// Get original size in bytes
    pub fn original_size(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }

    /// Get compression ratio
    pub fn compression_ratio(&self) -> f32 {
        self.compressed_size() as f32 / self.original_size() as f32
    }

    /// Serialize to bytes for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();

        // Header: quant_type, dtype tag, block_size, shape rank
        bytes.push(match self.quant_type {
            QuantType::Nf4 => 0,
            QuantType::Int8 => 1,
        });
        bytes.push(dtype_tag(self.dtype));
        bytes.extend_from_slice(&(self.block_size as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.shape.len() as u32).to_le_bytes());

        for dim in &self.shape {
            bytes.extend_from_slice(&(*dim as u64).to_le_bytes());
        }

        bytes.extend_from_slice(&(self.scales.len() as u32).to_le_bytes());
        for scale in &self.scales {
            bytes.extend_from_slice(&scale.to_le_bytes());
        }

        bytes.extend_from_slice(&(self.data.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&self.data);

        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        let too_short =
            || crate::SparseLLMError::Quantization("truncated quantized blob".to_string());

        let take = |pos: &mut usize, n: usize| -> crate::Result<&[u8]> {
            let slice = bytes.get(*pos..*pos + n).ok_or_else(too_short)?;
            *pos += n;
            Ok(slice)
        };

        let mut pos = 0;

        let quant_type = match take(&mut pos, 1)?[0] {
            0 => QuantType::Nf4,
            1 => QuantType::Int8,
            other => {
                return Err(crate::SparseLLMError::Quantization(format!(
                    "invalid quant type tag {}",
                    other
                )))
            }
        };
        let dtype = dtype_from_tag(take(&mut pos, 1)?[0])?;

        let block_size = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()) as usize;
        let shape_len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()) as usize;

        let mut shape = Vec::with_capacity(shape_len);
        for _ in 0..shape_len {
            shape.push(u64::from_le_bytes(take(&mut pos, 8)?.try_into().unwrap()) as usize);
        }

        let scales_len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()) as usize;
        let mut scales = Vec::with_capacity(scales_len);
        for _ in 0..scales_len {
            scales.push(f32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()));
        }

        let data_len = u64::from_le_bytes(take(&mut pos, 8)?.try_into().unwrap()) as usize;
        let data = take(&mut pos, data_len)?.to_vec();

        Ok(Self {
            data,
            scales,
            shape,
            dtype,
            block_size,
            quant_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_roundtrip() {
        let qt = QuantizedTensor::new(
            vec![1, 2, 3, 4],
            vec![1.0, 2.0],
            vec![2, 2],
            DType::BF16,
            64,
            QuantType::Nf4,
        );

        let bytes = qt.to_bytes();
        let restored = QuantizedTensor::from_bytes(&bytes).unwrap();

        assert_eq!(restored.data, qt.data);
        assert_eq!(restored.scales, qt.scales);
        assert_eq!(restored.shape, qt.shape);
        assert_eq!(restored.dtype, qt.dtype);
        assert_eq!(restored.block_size, qt.block_size);
        assert_eq!(restored.quant_type, qt.quant_type);
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let qt = QuantizedTensor::new(
            vec![9; 8],
            vec![0.5],
            vec![8],
            DType::F32,
            64,
            QuantType::Int8,
        );
        let bytes = qt.to_bytes();
        assert!(QuantizedTensor::from_bytes(&bytes[..bytes.len() - 3]).is_err());
    }
}
