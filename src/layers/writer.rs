//! Compressed-checkpoint output.
//!
//! Writes the model back out as one file per layer group (`embed_tokens`,
//! `layer_N`, `norm`, `lm_head`), so downstream layerwise runtimes can load
//! it piecemeal. Dense storage uses safetensors; Int8/NF4 storage writes
//! `.quant` containers of serialized [`QuantizedTensor`] blobs.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use candle_core::Tensor;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::WeightStorage;
use crate::model::LayerwiseModel;
use crate::quantization::{create_quantizer, QuantizedTensor, Quantizer};

/// Writes a compressed model to an output directory.
pub struct CheckpointWriter {
    output_dir: PathBuf,
    storage: WeightStorage,
    block_size: usize,
}

impl CheckpointWriter {
    pub fn new(output_dir: impl AsRef<Path>, storage: WeightStorage, block_size: usize) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            storage,
            block_size,
        }
    }

    /// Write all layer groups plus the updated `config.json`.
    pub fn write(&self, model: &LayerwiseModel) -> crate::Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;

        tracing::info!(
            "Writing compressed checkpoint to {:?} ({:?} storage)",
            self.output_dir,
            self.storage
        );

        let mut groups: Vec<(String, HashMap<String, Tensor>)> = Vec::new();

        groups.push((
            "embed_tokens".to_string(),
            HashMap::from([(
                "model.embed_tokens.weight".to_string(),
                model.embed_tokens().clone(),
            )]),
        ));

        for (idx, layer) in model.layers().iter().enumerate() {
            let mut tensors = HashMap::with_capacity(layer.weights.tensors.len());
            for (key, tensor) in &layer.weights.tensors {
                tensors.insert(format!("{}.{}", layer.name, key), tensor.clone());
            }
            groups.push((format!("layer_{}", idx), tensors));
        }

        groups.push((
            "norm".to_string(),
            HashMap::from([("model.norm.weight".to_string(), model.norm_weight().clone())]),
        ));

        if let Some(head) = model.lm_head_weight() {
            groups.push((
                "lm_head".to_string(),
                HashMap::from([("lm_head.weight".to_string(), head.clone())]),
            ));
        }

        let pb = ProgressBar::new(groups.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} Writing layers")
                .unwrap(),
        );

        let quantizer = create_quantizer(self.storage, self.block_size);
        for (group_name, tensors) in &groups {
            match &quantizer {
                None => {
                    let path = self.output_dir.join(format!("{}.safetensors", group_name));
                    candle_core::safetensors::save(tensors, path)?;
                }
                Some(quantizer) => {
                    let path = self.output_dir.join(format!("{}.quant", group_name));
                    write_quantized_group(&path, tensors, quantizer.as_ref())?;
                }
            }
            pb.inc(1);
        }
        pb.finish();

        let config_path = self.output_dir.join("config.json");
        let config_json = serde_json::to_string_pretty(model.config())?;
        std::fs::write(config_path, config_json)?;

        Ok(())
    }
}

/// Container layout: u32 entry count, then per entry a length-prefixed name
/// and a length-prefixed [`QuantizedTensor`] blob.
fn write_quantized_group(
    path: &Path,
    tensors: &HashMap<String, Tensor>,
    quantizer: &dyn Quantizer,
) -> crate::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(&(tensors.len() as u32).to_le_bytes())?;

    // Sorted so the container is byte-stable across runs
    let mut names: Vec<&String> = tensors.keys().collect();
    names.sort();

    for name in names {
        let blob = quantizer.quantize(&tensors[name])?.to_bytes();
        file.write_all(&(name.len() as u32).to_le_bytes())?;
        file.write_all(name.as_bytes())?;
        file.write_all(&(blob.len() as u64).to_le_bytes())?;
        file.write_all(&blob)?;
    }

    Ok(())
}

/// Read back one `.quant` container.
pub fn read_quantized_group(path: &Path) -> crate::Result<HashMap<String, QuantizedTensor>> {
    let mut bytes = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut bytes)?;

    let too_short = || crate::SparseLLMError::Quantization("truncated .quant file".to_string());
    let take = |pos: &mut usize, n: usize| -> crate::Result<&[u8]> {
        let slice = bytes.get(*pos..*pos + n).ok_or_else(too_short)?;
        *pos += n;
        Ok(slice)
    };

    let mut pos = 0;
    let count = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()) as usize;

    let mut tensors = HashMap::with_capacity(count);
    for _ in 0..count {
        let name_len = u32::from_le_bytes(take(&mut pos, 4)?.try_into().unwrap()) as usize;
        let name = String::from_utf8(take(&mut pos, name_len)?.to_vec())
            .map_err(|e| crate::SparseLLMError::Quantization(e.to_string()))?;
        let blob_len = u64::from_le_bytes(take(&mut pos, 8)?.try_into().unwrap()) as usize;
        let blob = take(&mut pos, blob_len)?;
        tensors.insert(name, QuantizedTensor::from_bytes(blob)?);
    }

    Ok(tensors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::Int8Quantizer;
    use candle_core::Device;

    #[test]
    fn test_quant_container_roundtrip() {
        let dir = std::env::temp_dir().join("rs-sparsellm-writer-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("group.quant");

        let mut tensors = HashMap::new();
        tensors.insert(
            "model.layers.0.self_attn.q_proj.weight".to_string(),
            Tensor::from_vec(vec![0.5f32, -0.25, 0.0, 1.0], &[2, 2], &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "model.layers.0.mlp.up_proj.weight".to_string(),
            Tensor::from_vec(vec![0.1f32; 8], &[2, 4], &Device::Cpu).unwrap(),
        );

        let quantizer = Int8Quantizer::with_block_size(4);
        write_quantized_group(&path, &tensors, &quantizer).unwrap();

        let restored = read_quantized_group(&path).unwrap();
        assert_eq!(restored.len(), 2);

        let q = &restored["model.layers.0.self_attn.q_proj.weight"];
        assert_eq!(q.shape, vec![2, 2]);

        std::fs::remove_dir_all(&dir).ok();
    }
}
