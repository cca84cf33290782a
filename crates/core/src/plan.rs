//! Model Plan Resolver: turns the user's mode and model selection into an
//! immutable, ordered execution plan.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// How the selected models are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMode {
    #[default]
    Single,
    Interpolate,
    Chain,
}

impl ModelMode {
    pub fn model_count(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Interpolate | Self::Chain => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Interpolate => "interpolate",
            Self::Chain => "chain",
        }
    }
}

impl fmt::Display for ModelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single" | "0" => Ok(Self::Single),
            "interpolate" | "interp" | "1" => Ok(Self::Interpolate),
            "chain" | "2" => Ok(Self::Chain),
            other => Err(format!(
                "unknown model mode '{other}' (expected single, interp or chain)"
            )),
        }
    }
}

/// Which selection slot a model came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSlot {
    Primary,
    Secondary,
}

impl fmt::Display for ModelSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Secondary => f.write_str("secondary"),
        }
    }
}

/// Reference to a model artifact on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub name: String,
    pub path: PathBuf,
    pub slot: ModelSlot,
}

impl ModelRef {
    pub fn new(path: impl Into<PathBuf>, slot: ModelSlot) -> Self {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self { name, path, slot }
    }

    pub fn in_slot(&self, slot: ModelSlot) -> Self {
        Self {
            slot,
            ..self.clone()
        }
    }

    fn ensure_exists(&self) -> Result<(), PipelineError> {
        if is_readable_file(&self.path) {
            Ok(())
        } else {
            Err(PipelineError::ModelMissing {
                slot: self.slot,
                path: Some(self.path.clone()),
            })
        }
    }
}

fn is_readable_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// One model invocation and the weight its output carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanStep {
    pub model: ModelRef,
    pub weight: f32,
}

/// Ordered one- or two-step plan. Built once per run, only through
/// [`resolve`], so it always holds the step count its strategy needs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelPlan {
    strategy: ModelMode,
    steps: Vec<PlanStep>,
}

impl ModelPlan {
    pub fn strategy(&self) -> ModelMode {
        self.strategy
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn first(&self) -> &PlanStep {
        &self.steps[0]
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelRef> {
        self.steps.iter().map(|step| &step.model)
    }

    /// Short human-readable summary, e.g. `4x_foo > 2x_bar`.
    pub fn describe(&self) -> String {
        let names: Vec<&str> = self.models().map(|m| m.name.as_str()).collect();
        match self.strategy {
            ModelMode::Single => names.join(""),
            ModelMode::Interpolate => format!(
                "{} ({:.0}%) + {} ({:.0}%)",
                names[0],
                self.steps[0].weight * 100.0,
                names[1],
                self.steps[1].weight * 100.0
            ),
            ModelMode::Chain => names.join(" > "),
        }
    }
}

/// Builds the execution plan for `mode`.
///
/// Only existence of the model files is checked here; loading is left to
/// the inference service. `blend` is a percentage and only consulted for
/// [`ModelMode::Interpolate`].
pub fn resolve(
    mode: ModelMode,
    model1: &ModelRef,
    model2: Option<&ModelRef>,
    blend: Option<f64>,
) -> Result<ModelPlan, PipelineError> {
    model1.ensure_exists()?;

    let steps = match mode {
        ModelMode::Single => vec![PlanStep {
            model: model1.clone(),
            weight: 1.0,
        }],
        ModelMode::Interpolate | ModelMode::Chain => {
            let model2 = model2.ok_or(PipelineError::ModelMissing {
                slot: ModelSlot::Secondary,
                path: None,
            })?;
            model2.ensure_exists()?;

            if mode == ModelMode::Interpolate {
                let t = blend_fraction(blend)?;
                vec![
                    PlanStep {
                        model: model1.clone(),
                        weight: 1.0 - t,
                    },
                    PlanStep {
                        model: model2.clone(),
                        weight: t,
                    },
                ]
            } else {
                vec![
                    PlanStep {
                        model: model1.clone(),
                        weight: 1.0,
                    },
                    PlanStep {
                        model: model2.clone(),
                        weight: 1.0,
                    },
                ]
            }
        }
    };

    Ok(ModelPlan {
        strategy: mode,
        steps,
    })
}

fn blend_fraction(blend: Option<f64>) -> Result<f32, PipelineError> {
    match blend {
        Some(value) if value.is_finite() && (0.0..=100.0).contains(&value) => {
            Ok((value / 100.0) as f32)
        }
        other => Err(PipelineError::InvalidBlend { blend: other }),
    }
}

/// Models currently picked by the user. Written by the front end through
/// setters, read by the coordinator when a run starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionState {
    model1: Option<ModelRef>,
    model2: Option<ModelRef>,
}

impl SelectionState {
    pub fn set_model1(&mut self, model: Option<ModelRef>) {
        self.model1 = model.map(|m| m.in_slot(ModelSlot::Primary));
    }

    pub fn set_model2(&mut self, model: Option<ModelRef>) {
        self.model2 = model.map(|m| m.in_slot(ModelSlot::Secondary));
    }

    pub fn model1(&self) -> Option<&ModelRef> {
        self.model1.as_ref()
    }

    pub fn model2(&self) -> Option<&ModelRef> {
        self.model2.as_ref()
    }

    /// Whether enough models are selected for `mode`. Does not touch disk.
    pub fn has_valid_selection(&self, mode: ModelMode) -> bool {
        match mode {
            ModelMode::Single => self.model1.is_some(),
            ModelMode::Interpolate | ModelMode::Chain => {
                self.model1.is_some() && self.model2.is_some()
            }
        }
    }

    pub fn resolve(&self, mode: ModelMode, blend: Option<f64>) -> Result<ModelPlan, PipelineError> {
        let model1 = self.model1.as_ref().ok_or(PipelineError::ModelMissing {
            slot: ModelSlot::Primary,
            path: None,
        })?;
        resolve(mode, model1, self.model2.as_ref(), blend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_file(dir: &Path, name: &str, slot: ModelSlot) -> ModelRef {
        let path = dir.join(name);
        std::fs::write(&path, b"onnx").expect("write model stub");
        ModelRef::new(path, slot)
    }

    #[test]
    fn single_plan_has_one_full_weight_step() {
        let dir = tempfile::tempdir().expect("tempdir");
        let m1 = model_file(dir.path(), "4x_a.onnx", ModelSlot::Primary);

        let plan = resolve(ModelMode::Single, &m1, None, None).expect("plan");
        assert_eq!(plan.strategy(), ModelMode::Single);
        assert_eq!(plan.steps().len(), 1);
        assert_eq!(plan.first().weight, 1.0);
        assert_eq!(plan.first().model.name, "4x_a");
    }

    #[test]
    fn single_plan_ignores_out_of_range_blend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let m1 = model_file(dir.path(), "a.onnx", ModelSlot::Primary);
        assert!(resolve(ModelMode::Single, &m1, None, Some(500.0)).is_ok());
    }

    #[test]
    fn interpolate_weights_follow_blend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let m1 = model_file(dir.path(), "a.onnx", ModelSlot::Primary);
        let m2 = model_file(dir.path(), "b.onnx", ModelSlot::Secondary);

        let plan = resolve(ModelMode::Interpolate, &m1, Some(&m2), Some(25.0)).expect("plan");
        let weights: Vec<f32> = plan.steps().iter().map(|s| s.weight).collect();
        assert_eq!(weights, vec![0.75, 0.25]);
        assert_eq!(plan.steps()[1].model.name, "b");
    }

    #[test]
    fn interpolate_rejects_blend_outside_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let m1 = model_file(dir.path(), "a.onnx", ModelSlot::Primary);
        let m2 = model_file(dir.path(), "b.onnx", ModelSlot::Secondary);

        for blend in [Some(-0.5), Some(100.5), Some(f64::NAN), None] {
            let err = resolve(ModelMode::Interpolate, &m1, Some(&m2), blend)
                .expect_err("blend must be rejected");
            assert!(matches!(err, PipelineError::InvalidBlend { .. }), "{err}");
        }
        assert!(resolve(ModelMode::Interpolate, &m1, Some(&m2), Some(0.0)).is_ok());
        assert!(resolve(ModelMode::Interpolate, &m1, Some(&m2), Some(100.0)).is_ok());
    }

    #[test]
    fn chain_keeps_model_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let m1 = model_file(dir.path(), "first.onnx", ModelSlot::Primary);
        let m2 = model_file(dir.path(), "second.onnx", ModelSlot::Secondary);

        let plan = resolve(ModelMode::Chain, &m1, Some(&m2), None).expect("plan");
        assert_eq!(plan.describe(), "first > second");
    }

    #[test]
    fn resolved_plan_carries_steps_for_its_strategy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let m1 = model_file(dir.path(), "first.onnx", ModelSlot::Primary);
        let m2 = model_file(dir.path(), "second.onnx", ModelSlot::Secondary);

        for (mode, steps) in [
            (ModelMode::Single, 1),
            (ModelMode::Interpolate, 2),
            (ModelMode::Chain, 2),
        ] {
            let plan = resolve(mode, &m1, Some(&m2), Some(50.0)).expect("plan");
            let json = serde_json::to_value(&plan).expect("serialize");
            assert_eq!(json["steps"].as_array().map(Vec::len), Some(steps), "{mode:?}");
        }
    }

    #[test]
    fn missing_model_file_is_reported_with_slot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let m1 = model_file(dir.path(), "a.onnx", ModelSlot::Primary);
        let ghost = ModelRef::new(dir.path().join("ghost.onnx"), ModelSlot::Secondary);

        let err = resolve(ModelMode::Chain, &m1, Some(&ghost), None).expect_err("missing");
        match err {
            PipelineError::ModelMissing { slot, path } => {
                assert_eq!(slot, ModelSlot::Secondary);
                assert_eq!(path, Some(dir.path().join("ghost.onnx")));
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = resolve(ModelMode::Interpolate, &m1, None, Some(50.0)).expect_err("unselected");
        assert!(matches!(
            err,
            PipelineError::ModelMissing { path: None, .. }
        ));
    }

    #[test]
    fn directory_is_not_a_model() {
        let dir = tempfile::tempdir().expect("tempdir");
        let m1 = ModelRef::new(dir.path(), ModelSlot::Primary);
        assert!(resolve(ModelMode::Single, &m1, None, None).is_err());
    }

    #[test]
    fn selection_state_tracks_slots() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = model_file(dir.path(), "a.onnx", ModelSlot::Secondary);

        let mut selection = SelectionState::default();
        assert!(!selection.has_valid_selection(ModelMode::Single));

        selection.set_model1(Some(a.clone()));
        assert_eq!(selection.model1().map(|m| m.slot), Some(ModelSlot::Primary));
        assert!(selection.has_valid_selection(ModelMode::Single));
        assert!(!selection.has_valid_selection(ModelMode::Chain));

        selection.set_model2(Some(a));
        assert!(selection.has_valid_selection(ModelMode::Interpolate));
        let plan = selection
            .resolve(ModelMode::Interpolate, Some(50.0))
            .expect("plan");
        assert_eq!(plan.steps()[0].weight, 0.5);
    }

    #[test]
    fn model_mode_parses_legacy_names() {
        assert_eq!("interp".parse::<ModelMode>(), Ok(ModelMode::Interpolate));
        assert_eq!("Chain".parse::<ModelMode>(), Ok(ModelMode::Chain));
        assert_eq!("0".parse::<ModelMode>(), Ok(ModelMode::Single));
        assert!("blend".parse::<ModelMode>().is_err());
    }
}
