//! Calibration data for one-shot compression.
//!
//! A calibration dataset is a small set of fixed-length token sequences. It
//! only drives activation statistics; no gradients ever flow through it. The
//! dataset is intended to be read fully exactly once per compression run.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{seq::SliceRandom, SeedableRng};
use tokenizers::Tokenizer;

/// One calibration sample: a `[1, seq_len]` row of token ids.
#[derive(Debug, Clone)]
pub struct CalibrationBatch {
    input_ids: Vec<u32>,
}

impl CalibrationBatch {
    pub fn new(input_ids: Vec<u32>) -> Self {
        Self { input_ids }
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.len()
    }

    /// Materialize the token ids on the compute device.
    pub fn to_tensor(&self, device: &Device) -> crate::Result<Tensor> {
        Tensor::from_vec(self.input_ids.clone(), &[1, self.input_ids.len()], device)
            .map_err(Into::into)
    }
}

/// A finite set of calibration samples with a uniform sequence length.
#[derive(Debug, Clone)]
pub struct CalibrationDataset {
    batches: Vec<CalibrationBatch>,
    seq_len: usize,
}

impl CalibrationDataset {
    /// Build a dataset by tokenizing a text corpus and sampling fixed-length
    /// windows from it.
    ///
    /// `seed` makes window selection reproducible; `None` seeds from entropy.
    pub fn from_text_file(
        path: impl AsRef<std::path::Path>,
        tokenizer: &Tokenizer,
        seq_len: usize,
        num_samples: usize,
        seed: Option<u64>,
    ) -> crate::Result<Self> {
        if seq_len == 0 || num_samples == 0 {
            return Err(crate::SparseLLMError::Calibration(
                "seq_len and num_samples must be positive".to_string(),
            ));
        }

        let text = std::fs::read_to_string(path)?;
        let encoding = tokenizer
            .encode(text.as_str(), false)
            .map_err(|e| crate::SparseLLMError::Tokenizer(e.to_string()))?;
        let ids = encoding.get_ids();

        let num_windows = ids.len() / seq_len;
        if num_windows == 0 {
            return Err(crate::SparseLLMError::Calibration(format!(
                "corpus has {} tokens, fewer than one {}-token window",
                ids.len(),
                seq_len
            )));
        }

        let mut window_starts: Vec<usize> = (0..num_windows).map(|w| w * seq_len).collect();
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        window_starts.shuffle(&mut rng);
        window_starts.truncate(num_samples);

        if window_starts.len() < num_samples {
            tracing::warn!(
                "Corpus only yields {} calibration windows of {} requested",
                window_starts.len(),
                num_samples
            );
        }

        let batches = window_starts
            .into_iter()
            .map(|start| CalibrationBatch::new(ids[start..start + seq_len].to_vec()))
            .collect();

        Ok(Self { batches, seq_len })
    }

    /// Build a dataset from pre-tokenized rows. All rows must share a length.
    pub fn from_token_batches(rows: Vec<Vec<u32>>) -> crate::Result<Self> {
        let seq_len = rows
            .first()
            .map(|r| r.len())
            .filter(|&len| len > 0)
            .ok_or_else(|| {
                crate::SparseLLMError::Calibration("empty calibration dataset".to_string())
            })?;

        if let Some(bad) = rows.iter().find(|r| r.len() != seq_len) {
            return Err(crate::SparseLLMError::Calibration(format!(
                "calibration rows must share one length: expected {}, found {}",
                seq_len,
                bad.len()
            )));
        }

        let batches = rows.into_iter().map(CalibrationBatch::new).collect();
        Ok(Self { batches, seq_len })
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn batches(&self) -> impl Iterator<Item = &CalibrationBatch> {
        self.batches.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_token_batches() {
        let dataset =
            CalibrationDataset::from_token_batches(vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]])
                .unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.seq_len(), 4);
    }

    #[test]
    fn test_mismatched_rows_rejected() {
        let result = CalibrationDataset::from_token_batches(vec![vec![1, 2, 3], vec![4, 5]]);
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_rejected() {
        assert!(CalibrationDataset::from_token_batches(vec![]).is_err());
    }

    #[test]
    fn test_batch_tensor_shape() {
        let batch = CalibrationBatch::new(vec![7, 8, 9]);
        let tensor = batch.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[1, 3]);
    }
}
