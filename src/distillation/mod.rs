//! Per-layer feature-imitation distillation.
//!
//! Adds a knowledge-distillation loss that matches intermediate layer
//! outputs between a student and a teacher model. Instead of installing
//! forward hooks, the training loop records layer outputs into explicit
//! capture registries (`record_student` / `record_teacher`); each record
//! overwrites the previous one, so no history is retained.
//!
//! Lifecycle: `Uninitialized → Active (initialize) → Finalized (finalize)`.

use std::collections::HashMap;

use candle_core::{DType, Tensor};
use candle_nn::{conv2d_no_bias, linear_no_bias, Conv2dConfig, Module, VarBuilder, VarMap};

/// Teacher magnitudes below this floor stop shrinking the normalization
/// denominator, keeping the loss finite for near-silent layers.
const MAGNITUDE_FLOOR: f32 = 1e-6;

/// Layer types eligible for auto-discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Linear,
    Conv,
}

/// A model that can enumerate its feature layers in depth-first order.
pub trait NamedLayers {
    fn named_layers(&self) -> Vec<(String, LayerKind)>;
}

/// The distillation teacher: a module, or the sentinel that disables
/// distillation entirely.
pub enum DistillationTeacher {
    /// Distillation is inert; every loss contribution is zero
    Disable,
    /// Match features against this model's layers
    Module(Box<dyn NamedLayers>),
}

/// Which side's features get projected to the other's width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProjectFrom {
    #[default]
    Teacher,
    Student,
}

/// Configuration for [`PerLayerDistillation`]
#[derive(Debug, Clone)]
pub struct DistillationConfig {
    /// Weight of the distillation term in the total loss
    pub gain: f64,
    /// Divide each pair's MSE by the teacher output magnitude
    pub normalize: bool,
    /// Learn a projection between mismatched feature widths
    pub project_features: bool,
    pub project_from: ProjectFrom,
    /// Explicit student layer names; `None` auto-discovers by type
    pub student_names: Option<Vec<String>>,
    /// Explicit teacher layer names; defaults to `student_names`
    pub teacher_names: Option<Vec<String>>,
}

impl Default for DistillationConfig {
    fn default() -> Self {
        Self {
            gain: 1.5,
            normalize: true,
            project_features: false,
            project_from: ProjectFrom::Teacher,
            student_names: None,
            teacher_names: None,
        }
    }
}

/// Last-output-wins capture registry for one model's layers.
#[derive(Debug, Default)]
pub struct FeatureCapture {
    outputs: HashMap<String, Tensor>,
    shapes: HashMap<String, Vec<usize>>,
}

impl FeatureCapture {
    /// Store a layer's output, overwriting any previous capture. The shape
    /// is remembered from the first call for lazy projection sizing.
    fn record(&mut self, name: &str, output: &Tensor) {
        self.shapes
            .entry(name.to_string())
            .or_insert_with(|| output.dims().to_vec());
        self.outputs.insert(name.to_string(), output.clone());
    }

    fn get(&self, name: &str) -> Option<&Tensor> {
        self.outputs.get(name)
    }

    fn shape(&self, name: &str) -> Option<&Vec<usize>> {
        self.shapes.get(name)
    }

    fn clear(&mut self) {
        self.outputs.clear();
        self.shapes.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Active,
    Finalized,
}

enum ProjectionOp {
    Linear(candle_nn::Linear),
    Conv(candle_nn::Conv2d),
}

impl ProjectionOp {
    fn forward(&self, features: &Tensor) -> crate::Result<Tensor> {
        match self {
            ProjectionOp::Linear(linear) => linear.forward(features).map_err(Into::into),
            ProjectionOp::Conv(conv) => conv.forward(features).map_err(Into::into),
        }
    }
}

/// Feature-imitation modifier over paired student/teacher layers.
pub struct PerLayerDistillation {
    config: DistillationConfig,
    phase: Phase,
    enabled: bool,
    pairs: Vec<(String, String)>,
    student_capture: FeatureCapture,
    teacher_capture: FeatureCapture,
    /// Lazily initialized, one per pair, sized from the first captures
    projections: Option<Vec<ProjectionOp>>,
    var_map: VarMap,
}

impl PerLayerDistillation {
    pub fn new(config: DistillationConfig) -> Self {
        Self {
            config,
            phase: Phase::Uninitialized,
            enabled: false,
            pairs: Vec::new(),
            student_capture: FeatureCapture::default(),
            teacher_capture: FeatureCapture::default(),
            projections: None,
            var_map: VarMap::new(),
        }
    }

    /// Resolve (student, teacher) layer pairs and activate capture.
    pub fn initialize(
        &mut self,
        student: &dyn NamedLayers,
        teacher: DistillationTeacher,
    ) -> crate::Result<()> {
        if self.phase != Phase::Uninitialized {
            return Err(crate::SparseLLMError::Configuration(
                "distillation modifier is already initialized".to_string(),
            ));
        }

        let teacher = match teacher {
            DistillationTeacher::Disable => {
                tracing::info!("Distillation disabled; loss contributions short-circuit to zero");
                self.enabled = false;
                self.phase = Phase::Active;
                return Ok(());
            }
            DistillationTeacher::Module(module) => module,
        };

        let student_names = match &self.config.student_names {
            Some(names) => resolve_named(student, names)?,
            None => discover_typed(student),
        };
        let teacher_names = match self.config.teacher_names.as_ref().or(self.config.student_names.as_ref()) {
            Some(names) => resolve_named(teacher.as_ref(), names)?,
            None => discover_typed(teacher.as_ref()),
        };

        // Positional pairing is only sound when both sides resolve the same
        // number of layers
        if student_names.len() != teacher_names.len() {
            return Err(crate::SparseLLMError::Configuration(format!(
                "student resolves {} distillation layers but teacher resolves {}",
                student_names.len(),
                teacher_names.len()
            )));
        }
        if student_names.is_empty() {
            return Err(crate::SparseLLMError::Configuration(
                "no distillation layers resolved".to_string(),
            ));
        }

        tracing::info!("Distilling {} layer pairs", student_names.len());

        self.pairs = student_names.into_iter().zip(teacher_names).collect();
        self.enabled = true;
        self.phase = Phase::Active;
        Ok(())
    }

    /// Record a student layer's output for the next loss computation.
    pub fn record_student(&mut self, name: &str, output: &Tensor) -> crate::Result<()> {
        self.ensure_active("record_student")?;
        if self.enabled && self.pairs.iter().any(|(s, _)| s == name) {
            self.student_capture.record(name, output);
        }
        Ok(())
    }

    /// Record a teacher layer's output for the next loss computation.
    pub fn record_teacher(&mut self, name: &str, output: &Tensor) -> crate::Result<()> {
        self.ensure_active("record_teacher")?;
        if self.enabled && self.pairs.iter().any(|(_, t)| t == name) {
            self.teacher_capture.record(name, output);
        }
        Ok(())
    }

    /// Summed (optionally normalized) MSE between every captured pair.
    pub fn compute_distillation_loss(&mut self) -> crate::Result<Tensor> {
        self.ensure_active("compute_distillation_loss")?;

        if !self.enabled {
            return Tensor::zeros((), DType::F32, &candle_core::Device::Cpu).map_err(Into::into);
        }

        if self.config.project_features && self.projections.is_none() {
            self.initialize_projections()?;
        }

        let mut total: Option<Tensor> = None;

        for (index, (student_name, teacher_name)) in self.pairs.iter().enumerate() {
            let student_output = self.student_capture.get(student_name).ok_or_else(|| {
                crate::SparseLLMError::pipeline_state(
                    "distillation",
                    format!("no captured output for student layer '{}'", student_name),
                )
            })?;
            let teacher_output = self.teacher_capture.get(teacher_name).ok_or_else(|| {
                crate::SparseLLMError::pipeline_state(
                    "distillation",
                    format!("no captured output for teacher layer '{}'", teacher_name),
                )
            })?;

            let mut student_output = student_output.clone();
            let mut teacher_output = teacher_output.clone();
            if let Some(projections) = &self.projections {
                match self.config.project_from {
                    ProjectFrom::Teacher => {
                        teacher_output = projections[index].forward(&teacher_output)?
                    }
                    ProjectFrom::Student => {
                        student_output = projections[index].forward(&student_output)?
                    }
                }
            }

            let mut difference = (&student_output - &teacher_output)?.sqr()?.mean_all()?;

            if self.config.normalize {
                let magnitude = teacher_output
                    .sqr()?
                    .mean_all()?
                    .to_dtype(DType::F32)?
                    .to_scalar::<f32>()?;
                difference = (difference / magnitude.max(MAGNITUDE_FLOOR) as f64)?;
            }

            total = Some(match total {
                Some(total) => (&total + &difference)?,
                None => difference,
            });
        }

        total.ok_or_else(|| {
            crate::SparseLLMError::pipeline_state("distillation", "no layer pairs to distill")
        })
    }

    /// `base_loss + gain * distillation_loss`; exactly `base_loss` when the
    /// teacher is the disable sentinel.
    pub fn compute_total_loss(
        &self,
        base_loss: &Tensor,
        distillation_loss: &Tensor,
    ) -> crate::Result<Tensor> {
        if !self.enabled {
            return Ok(base_loss.clone());
        }
        let weighted = (distillation_loss * self.config.gain)?;
        (base_loss + &weighted).map_err(Into::into)
    }

    /// Trainable projection parameters, for the caller's optimizer.
    pub fn projection_vars(&self) -> Vec<candle_core::Var> {
        self.var_map.all_vars()
    }

    /// Release captures and projections. Safe to call repeatedly.
    pub fn finalize(&mut self) {
        self.student_capture.clear();
        self.teacher_capture.clear();
        self.projections = None;
        self.phase = Phase::Finalized;
    }

    fn ensure_active(&self, operation: &str) -> crate::Result<()> {
        match self.phase {
            Phase::Active => Ok(()),
            Phase::Uninitialized => Err(crate::SparseLLMError::Configuration(format!(
                "{} requires an initialized distillation modifier",
                operation
            ))),
            Phase::Finalized => Err(crate::SparseLLMError::Configuration(format!(
                "{} called on a finalized distillation modifier",
                operation
            ))),
        }
    }

    /// Size one projection per pair from the first captured shapes.
    /// 4-D features get a 1x1 convolution over channels, everything else a
    /// no-bias linear over the last dimension.
    fn initialize_projections(&mut self) -> crate::Result<()> {
        let mut projections = Vec::with_capacity(self.pairs.len());

        for (index, (student_name, teacher_name)) in self.pairs.iter().enumerate() {
            let student_shape = self.student_capture.shape(student_name).ok_or_else(|| {
                crate::SparseLLMError::pipeline_state(
                    "distillation",
                    format!("projection sizing needs a '{}' capture first", student_name),
                )
            })?;
            let teacher_shape = self.teacher_capture.shape(teacher_name).ok_or_else(|| {
                crate::SparseLLMError::pipeline_state(
                    "distillation",
                    format!("projection sizing needs a '{}' capture first", teacher_name),
                )
            })?;

            let reference = self.student_capture.get(student_name).ok_or_else(|| {
                crate::SparseLLMError::pipeline_state(
                    "distillation",
                    "projection sizing needs a live student capture",
                )
            })?;
            let vb = VarBuilder::from_varmap(&self.var_map, reference.dtype(), reference.device());
            let vb = vb.pp(format!("projection_{}", index));

            let projection = if student_shape.len() == 4 {
                let (from, to) = match self.config.project_from {
                    ProjectFrom::Teacher => (teacher_shape[1], student_shape[1]),
                    ProjectFrom::Student => (student_shape[1], teacher_shape[1]),
                };
                ProjectionOp::Conv(conv2d_no_bias(from, to, 1, Conv2dConfig::default(), vb)?)
            } else {
                let last = student_shape.len() - 1;
                let (from, to) = match self.config.project_from {
                    ProjectFrom::Teacher => (teacher_shape[last], student_shape[last]),
                    ProjectFrom::Student => (student_shape[last], teacher_shape[last]),
                };
                ProjectionOp::Linear(linear_no_bias(from, to, vb)?)
            };

            projections.push(projection);
        }

        self.projections = Some(projections);
        Ok(())
    }
}

/// Depth-first typed discovery: every Linear or Conv layer.
fn discover_typed(model: &dyn NamedLayers) -> Vec<String> {
    model
        .named_layers()
        .into_iter()
        .filter(|(_, kind)| matches!(kind, LayerKind::Linear | LayerKind::Conv))
        .map(|(name, _)| name)
        .collect()
}

/// Validate an explicit name list against the model's layers, preserving
/// the requested order.
fn resolve_named(model: &dyn NamedLayers, names: &[String]) -> crate::Result<Vec<String>> {
    let available: Vec<String> = model.named_layers().into_iter().map(|(n, _)| n).collect();

    for name in names {
        if !available.iter().any(|a| a == name) {
            return Err(crate::SparseLLMError::Configuration(format!(
                "distillation layer '{}' not found in model",
                name
            )));
        }
    }

    Ok(names.to_vec())
}
