//! Accumulated pipeline state.
//!
//! The recognized keys are typed struct fields rather than a string-keyed
//! map, so a stage cannot invent a key and contracts are checked at compile
//! time. Merging is last-writer-wins per field; an overwrite is logged so a
//! colliding stage pair is observable rather than silent. Every stage must
//! refresh `outputs`, since they become the next stage's inputs.

use candle_core::Tensor;

/// State threaded through every pipeline stage. Created at run start,
/// discarded at run end; the finalization payload is extracted first.
#[derive(Debug, Default)]
pub struct PipelineState {
    /// Hidden states produced by the last stage, one tensor per
    /// calibration batch. Stage *i+1* consumes exactly these.
    pub outputs: Option<Vec<Tensor>>,
    /// Additive causal mask shared by all layers
    pub attention_mask: Option<Tensor>,
    /// `[1, seq_len]` position ids shared by all layers
    pub position_ids: Option<Tensor>,
    /// KV-cache flag captured by the bottom stage before calibration
    pub use_cache: Option<bool>,
}

/// Partial state returned by a stage, merged into [`PipelineState`].
#[derive(Debug, Default)]
pub struct StateUpdate {
    pub outputs: Option<Vec<Tensor>>,
    pub attention_mask: Option<Tensor>,
    pub position_ids: Option<Tensor>,
    pub use_cache: Option<bool>,
}

impl PipelineState {
    /// Merge a stage's update, last writer wins per field.
    pub fn merge(&mut self, update: StateUpdate) {
        if update.outputs.is_some() {
            if self.outputs.is_some() {
                tracing::debug!("State key 'outputs' overwritten");
            }
            self.outputs = update.outputs;
        }
        if update.attention_mask.is_some() {
            if self.attention_mask.is_some() {
                tracing::debug!("State key 'attention_mask' overwritten");
            }
            self.attention_mask = update.attention_mask;
        }
        if update.position_ids.is_some() {
            if self.position_ids.is_some() {
                tracing::debug!("State key 'position_ids' overwritten");
            }
            self.position_ids = update.position_ids;
        }
        if update.use_cache.is_some() {
            if self.use_cache.is_some() {
                tracing::debug!("State key 'use_cache' overwritten");
            }
            self.use_cache = update.use_cache;
        }
    }

    /// The inputs the next stage consumes; absence is a pipeline-state error.
    pub fn require_outputs(&self, stage: &str) -> crate::Result<&Vec<Tensor>> {
        self.outputs.as_ref().ok_or_else(|| {
            crate::SparseLLMError::pipeline_state(
                stage,
                "expected 'outputs' from the previous stage, found none",
            )
        })
    }
}

/// What survives the pipeline state for finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizationPayload {
    /// KV-cache flag to restore on the model
    pub use_cache: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_merge_last_writer_wins() {
        let mut state = PipelineState::default();

        let t1 = Tensor::zeros((1, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        state.merge(StateUpdate {
            outputs: Some(vec![t1]),
            use_cache: Some(true),
            ..Default::default()
        });
        assert_eq!(state.outputs.as_ref().unwrap().len(), 1);
        assert_eq!(state.use_cache, Some(true));

        let t2 = Tensor::zeros((1, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
        let t3 = t2.clone();
        state.merge(StateUpdate {
            outputs: Some(vec![t2, t3]),
            ..Default::default()
        });

        // outputs replaced, untouched keys preserved
        assert_eq!(state.outputs.as_ref().unwrap().len(), 2);
        assert_eq!(state.use_cache, Some(true));
    }

    #[test]
    fn test_require_outputs_missing() {
        let state = PipelineState::default();
        let err = state.require_outputs("bottom").unwrap_err();
        assert!(matches!(
            err,
            crate::SparseLLMError::PipelineState { ref stage, .. } if stage == "bottom"
        ));
    }
}
