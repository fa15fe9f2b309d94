//! Per-layer compression unit.
//!
//! A `LayerCompressor` is constructed fresh for each layer of each run and
//! consumed by `compress`; nothing survives across layers except the
//! returned state update. The cycle is: upload the layer, capture
//! per-projection calibration statistics with an instrumented forward,
//! solve for compressed weights, then run exactly one true forward pass
//! per batch so the next layer sees the compressed layer's real outputs.

use std::collections::HashMap;

use candle_core::{Device, Tensor, D};

use crate::config::CompressionConfig;
use crate::model::{LayerwiseModel, ModelAdapter};
use crate::solver::{InputStats, LayerTelemetry, SolveTarget, WeightSolver};
use crate::utils::clean_memory;

use super::{PipelineState, StateUpdate};

/// Compresses exactly one decoder layer.
pub struct LayerCompressor<'a> {
    adapter: &'a dyn ModelAdapter,
    solver: &'a dyn WeightSolver,
    layer_idx: usize,
    inputs: Vec<Tensor>,
    config: &'a CompressionConfig,
}

impl<'a> LayerCompressor<'a> {
    pub fn new(
        adapter: &'a dyn ModelAdapter,
        solver: &'a dyn WeightSolver,
        layer_idx: usize,
        inputs: Vec<Tensor>,
        config: &'a CompressionConfig,
    ) -> Self {
        Self {
            adapter,
            solver,
            layer_idx,
            inputs,
            config,
        }
    }

    /// Solve this layer's weights and propagate its true outputs.
    pub fn compress(
        self,
        model: &mut LayerwiseModel,
        device: &Device,
        state: &PipelineState,
    ) -> crate::Result<(StateUpdate, LayerTelemetry)> {
        let stage = format!("layer {}", self.layer_idx);
        let position_ids = state.position_ids.as_ref().ok_or_else(|| {
            crate::SparseLLMError::pipeline_state(&stage, "no 'position_ids' in state")
        })?;
        let attention_mask = state.attention_mask.as_ref();

        let mut layer = model.layer(self.layer_idx)?.weights.to_device(device)?;

        // Instrumented pass over every calibration batch: accumulate the
        // input second moment of each target projection
        let mut stats_map: HashMap<String, InputStats> = HashMap::new();
        for input in &self.inputs {
            let input = input.to_device(device)?;
            let captured = self.adapter.capture_projection_inputs(
                &layer,
                &input,
                attention_mask,
                position_ids,
            )?;
            for (name, activations) in captured {
                let dim = activations.dim(D::Minus1)?;
                stats_map
                    .entry(name)
                    .or_insert_with(|| InputStats::new(dim))
                    .update(&activations)?;
            }
        }

        let mut targets = Vec::with_capacity(self.adapter.target_projections().len());
        for &projection in self.adapter.target_projections() {
            let weight = layer.get(&format!("{}.weight", projection))?.clone();
            let stats = stats_map.remove(projection).ok_or_else(|| {
                crate::SparseLLMError::solver(
                    self.layer_idx,
                    format!("no activations captured for projection '{}'", projection),
                )
            })?;
            targets.push(SolveTarget {
                name: projection.to_string(),
                weight,
                stats,
            });
        }

        let telemetry =
            self.solver
                .compress_layer(self.layer_idx, &mut targets, &self.config.solver_args())?;

        for target in targets {
            layer.insert(format!("{}.weight", target.name), target.weight);
        }

        // Exactly one true forward pass per batch through the compressed
        // layer; the next layer must never calibrate on stale activations
        let mut outputs = Vec::with_capacity(self.inputs.len());
        for input in &self.inputs {
            let input = input.to_device(device)?;
            outputs.push(
                self.adapter
                    .forward_layer(&layer, &input, attention_mask, position_ids)?,
            );
        }

        // Persist the compressed weights on the host copy and release the
        // device working set before the next layer starts
        model.layer_mut(self.layer_idx)?.weights = layer.to_device(&Device::Cpu)?;
        drop(layer);
        clean_memory();

        Ok((
            StateUpdate {
                outputs: Some(outputs),
                ..Default::default()
            },
            telemetry,
        ))
    }
}
