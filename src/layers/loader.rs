//! Checkpoint loading with memory mapping.
//!
//! Reads every `*.safetensors` shard of a HuggingFace-style checkpoint and
//! groups the tensors into embedding / decoder-layer / final-norm / lm-head
//! buckets. Layer tensors are re-keyed by their in-layer path so downstream
//! code is independent of the checkpoint's top-level prefix.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;

/// Which bucket a checkpoint tensor belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorGroup {
    Embedding,
    Layer(usize),
    FinalNorm,
    Head,
    Other,
}

/// Classify a checkpoint tensor name and strip its group prefix.
///
/// `model.layers.5.self_attn.q_proj.weight` -> `(Layer(5), "self_attn.q_proj.weight")`
pub fn classify_tensor_name(name: &str) -> (TensorGroup, String) {
    if name.contains("embed_tokens") || name.contains("wte") {
        return (TensorGroup::Embedding, "weight".to_string());
    }
    if name.starts_with("lm_head") {
        return (TensorGroup::Head, "weight".to_string());
    }

    let parts: Vec<&str> = name.split('.').collect();
    for (i, part) in parts.iter().enumerate() {
        if *part == "layers" || *part == "h" {
            if let Some(idx) = parts.get(i + 1).and_then(|s| s.parse::<usize>().ok()) {
                let rest = parts[i + 2..].join(".");
                return (TensorGroup::Layer(idx), rest);
            }
        }
    }

    if name.contains("norm") || name.contains("ln_f") {
        return (TensorGroup::FinalNorm, "weight".to_string());
    }

    (TensorGroup::Other, name.to_string())
}

/// All tensors of a checkpoint, grouped for layerwise processing
#[derive(Debug, Default)]
pub struct CheckpointTensors {
    pub embedding: Option<Tensor>,
    pub layers: BTreeMap<usize, HashMap<String, Tensor>>,
    pub final_norm: Option<Tensor>,
    pub lm_head: Option<Tensor>,
}

/// Loads a sharded safetensors checkpoint into host memory.
pub struct CheckpointLoader {
    /// Checkpoint directory
    model_dir: PathBuf,
    /// Data type tensors are converted to after loading
    dtype: DType,
}

impl CheckpointLoader {
    pub fn new(model_dir: impl AsRef<Path>, dtype: DType) -> Self {
        Self {
            model_dir: model_dir.as_ref().to_path_buf(),
            dtype,
        }
    }

    /// Read every shard and bucket its tensors.
    pub fn load(&self) -> crate::Result<CheckpointTensors> {
        let shard_files = self.find_safetensor_files()?;
        if shard_files.is_empty() {
            return Err(crate::SparseLLMError::ModelNotFound(format!(
                "no safetensors shards in {:?}",
                self.model_dir
            )));
        }

        let mut grouped = CheckpointTensors::default();
        for shard_path in &shard_files {
            self.load_shard(shard_path, &mut grouped)?;
        }

        Ok(grouped)
    }

    fn find_safetensor_files(&self) -> crate::Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for entry in std::fs::read_dir(&self.model_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "safetensors") {
                files.push(path);
            }
        }

        // Sort for consistent ordering across shards
        files.sort();
        Ok(files)
    }

    fn load_shard(&self, shard_path: &Path, grouped: &mut CheckpointTensors) -> crate::Result<()> {
        tracing::debug!("Loading shard {:?}", shard_path);

        let file = std::fs::File::open(shard_path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let shard = SafeTensors::deserialize(&mmap)
            .map_err(|e| crate::SparseLLMError::LayerLoad(e.to_string()))?;

        for (name, view) in shard.tensors() {
            let (group, key) = classify_tensor_name(&name);
            if group == TensorGroup::Other {
                tracing::debug!("Skipping unclassified tensor '{}'", name);
                continue;
            }

            let tensor = self.load_tensor(&view)?;
            match group {
                TensorGroup::Embedding => grouped.embedding = Some(tensor),
                TensorGroup::FinalNorm => grouped.final_norm = Some(tensor),
                TensorGroup::Head => grouped.lm_head = Some(tensor),
                TensorGroup::Layer(idx) => {
                    grouped.layers.entry(idx).or_default().insert(key, tensor);
                }
                TensorGroup::Other => unreachable!(),
            }
        }

        Ok(())
    }

    fn load_tensor(&self, view: &safetensors::tensor::TensorView<'_>) -> crate::Result<Tensor> {
        let shape: Vec<usize> = view.shape().to_vec();
        let dtype = convert_safetensor_dtype(view.dtype());

        let tensor = Tensor::from_raw_buffer(view.data(), dtype, &shape, &Device::Cpu)?;
        tensor.to_dtype(self.dtype).map_err(Into::into)
    }
}

/// Convert safetensor dtype to candle dtype
fn convert_safetensor_dtype(dtype: safetensors::Dtype) -> DType {
    match dtype {
        safetensors::Dtype::F16 => DType::F16,
        safetensors::Dtype::BF16 => DType::BF16,
        safetensors::Dtype::F32 => DType::F32,
        safetensors::Dtype::F64 => DType::F64,
        safetensors::Dtype::U8 => DType::U8,
        safetensors::Dtype::U16 => DType::U32,
        safetensors::Dtype::U32 => DType::U32,
        safetensors::Dtype::I8 => DType::I64, // Candle doesn't have I8
        safetensors::Dtype::I16 => DType::I64,
        safetensors::Dtype::I32 => DType::I64,
        safetensors::Dtype::I64 => DType::I64,
        _ => DType::F32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_tensor_name() {
        assert_eq!(
            classify_tensor_name("model.embed_tokens.weight"),
            (TensorGroup::Embedding, "weight".to_string())
        );
        assert_eq!(
            classify_tensor_name("model.layers.5.self_attn.q_proj.weight"),
            (TensorGroup::Layer(5), "self_attn.q_proj.weight".to_string())
        );
        assert_eq!(
            classify_tensor_name("transformer.h.12.mlp.c_proj.weight"),
            (TensorGroup::Layer(12), "mlp.c_proj.weight".to_string())
        );
        assert_eq!(
            classify_tensor_name("lm_head.weight"),
            (TensorGroup::Head, "weight".to_string())
        );
        assert_eq!(
            classify_tensor_name("model.norm.weight"),
            (TensorGroup::FinalNorm, "weight".to_string())
        );
        assert_eq!(
            classify_tensor_name("rotary_emb.inv_freq").0,
            TensorGroup::Other
        );
    }

    #[test]
    fn test_dtype_conversion() {
        assert!(matches!(
            convert_safetensor_dtype(safetensors::Dtype::F16),
            DType::F16
        ));
        assert!(matches!(
            convert_safetensor_dtype(safetensors::Dtype::BF16),
            DType::BF16
        ));
        assert!(matches!(
            convert_safetensor_dtype(safetensors::Dtype::F32),
            DType::F32
        ));
    }
}
