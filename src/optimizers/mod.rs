//! Optimizers turning a loss into variable update targets.
//!
//! Optimizers work on the graph: [`Optimizer::prepare_targets`] requests one
//! gradient per trainable variable from [`autograd`](crate::autograd),
//! allocates the optimizer's slots in the [`GraphState`], and returns the
//! `Assign` targets a training step executes. All targets of one step are
//! computed from the values the variables had before the step.
//!
//! The trainable variables are read once, in registration order, and the
//! gradients are zipped with them by index.

pub mod adaptive;
pub mod sgd;

pub use self::adaptive::{AdaDelta, AdaGrad, Adam, Adamax, RmsProp};
pub use self::sgd::{Momentum, Sgd};

use crate::autograd::Gradients;
use crate::error::{Error, Result};
use crate::state::GraphState;
use crate::tensor::Tensor;
use log::debug;
use serde::{Deserialize, Serialize};
use std::rc::Rc;

/// A new value for a named variable, computed from pre-step values.
pub type Update = (String, Tensor);

/// The update rule of one optimization algorithm.
pub trait GradientApplying {
    fn name(&self) -> &'static str;

    /// Rejects hyperparameters outside their valid range.
    fn validate(&self) -> Result<()>;

    /// Slot names allocated per trainable variable.
    fn slot_names(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Allocates per-variable slots and shared optimizer state.
    fn create_slots(&self, _state: &mut GraphState, _variables: &[String]) -> Result<()> {
        Ok(())
    }

    /// Updates of one variable and its slots.
    fn apply_gradient(&self, state: &GraphState, variable: &str, value: &Tensor, gradient: &Tensor) -> Result<Vec<Update>>;

    /// Updates of shared optimizer state, after every variable.
    fn finish(&self, _state: &GraphState) -> Result<Vec<Update>> {
        Ok(Vec::new())
    }
}

/// Gradient clipping applied before the update rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type")]
pub enum ClipGradient {
    #[default]
    NoClip,
    /// Clamps every gradient element into `[-clip_value, clip_value]`.
    ByValue { clip_value: f32 },
    /// Rescales gradients whose L2 norm exceeds `clip_norm`. Not supported yet;
    /// compiling with it fails.
    ByNorm { clip_norm: f32 },
}

impl ClipGradient {
    pub fn validate(&self) -> Result<()> {
        match *self {
            ClipGradient::NoClip => Ok(()),
            ClipGradient::ByValue { clip_value } if clip_value > 0.0 => Ok(()),
            ClipGradient::ByValue { clip_value } => {
                Err(Error::config(format!("clip value must be positive, got {}", clip_value)))
            }
            ClipGradient::ByNorm { .. } => Err(Error::config("gradient clipping by norm is not supported")),
        }
    }

    pub fn apply(&self, gradient: &Tensor) -> Result<Tensor> {
        self.validate()?;
        Ok(match *self {
            ClipGradient::ByValue { clip_value } => gradient.clip(-clip_value, clip_value),
            _ => gradient.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OptimizerKind {
    Sgd(Sgd),
    Momentum(Momentum),
    Adam(Adam),
    Adamax(Adamax),
    AdaGrad(AdaGrad),
    AdaDelta(AdaDelta),
    RmsProp(RmsProp),
}

impl OptimizerKind {
    fn rule(&self) -> &dyn GradientApplying {
        match self {
            OptimizerKind::Sgd(o) => o,
            OptimizerKind::Momentum(o) => o,
            OptimizerKind::Adam(o) => o,
            OptimizerKind::Adamax(o) => o,
            OptimizerKind::AdaGrad(o) => o,
            OptimizerKind::AdaDelta(o) => o,
            OptimizerKind::RmsProp(o) => o,
        }
    }
}

macro_rules! impl_into_kind {
    ($($rule:ident),* $(,)?) => {
        $(
            impl From<$rule> for OptimizerKind {
                fn from(rule: $rule) -> Self {
                    OptimizerKind::$rule(rule)
                }
            }
        )*
    };
}

impl_into_kind!(Sgd, Momentum, Adam, Adamax, AdaGrad, AdaDelta, RmsProp);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Optimizer {
    pub kind: OptimizerKind,
    #[serde(default)]
    pub clip_gradient: ClipGradient,
}

impl Optimizer {
    /// Checked constructor.
    pub fn new(kind: impl Into<OptimizerKind>) -> Result<Self> {
        let optimizer = Self { kind: kind.into(), clip_gradient: ClipGradient::NoClip };
        optimizer.kind.rule().validate()?;
        Ok(optimizer)
    }

    pub fn sgd(learning_rate: f32) -> Result<Self> {
        Self::new(Sgd::new(learning_rate))
    }

    pub fn adam() -> Self {
        Self { kind: Adam::default().into(), clip_gradient: ClipGradient::NoClip }
    }

    /// Clipping is checked at compile time.
    pub fn with_clip_gradient(mut self, clip_gradient: ClipGradient) -> Self {
        self.clip_gradient = clip_gradient;
        self
    }

    pub fn name(&self) -> &'static str {
        self.kind.rule().name()
    }

    pub fn slot_names(&self) -> Vec<&'static str> {
        self.kind.rule().slot_names()
    }

    pub fn validate(&self) -> Result<()> {
        self.kind.rule().validate()?;
        self.clip_gradient.validate()
    }

    /// Differentiates `loss`, allocates slots and returns the `Assign`
    /// targets of one training step.
    pub fn prepare_targets(&self, state: &mut GraphState, loss: &Tensor) -> Result<Vec<Tensor>> {
        self.validate()?;
        let rule = self.kind.rule();
        let context = Rc::clone(state.context());

        let trainable: Vec<(String, usize)> = state
            .trainable_variables()
            .iter()
            .map(|spec| (spec.name.clone(), spec.node))
            .collect();
        let wrt: Vec<usize> = trainable.iter().map(|(_, node)| *node).collect();
        let gradients = {
            let mut graph = context.borrow_mut();
            Gradients::new(graph.main_graph_mut()).build(loss.node_id, &wrt)?
        };
        if gradients.len() != trainable.len() {
            return Err(Error::lifecycle(format!(
                "expected {} gradients, got {}",
                trainable.len(),
                gradients.len()
            )));
        }

        let names: Vec<String> = trainable.iter().map(|(name, _)| name.clone()).collect();
        rule.create_slots(state, &names)?;

        let mut targets = Vec::new();
        for ((name, node), gradient) in trainable.iter().zip(&gradients) {
            let value = Tensor::from_node(&context, *node);
            let gradient = self.clip_gradient.apply(&Tensor::from_node(&context, *gradient))?;
            for (target, new_value) in rule.apply_gradient(state, name, &value, &gradient)? {
                targets.push(new_value.assign_to(&target));
            }
        }
        for (target, new_value) in rule.finish(state)? {
            targets.push(new_value.assign_to(&target));
        }
        debug!(optimizer = rule.name(), variables = trainable.len(), targets = targets.len(); "update targets prepared");
        Ok(targets)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::initializers::Initializer;
    use crate::state::slot_variable_name;
    use ndarray::{array, ArrayD};
    use std::collections::HashMap;

    /// A state with `w = [1, -2]` and the loss `sum(w^2)`, gradient `2w`.
    pub(crate) fn quadratic_problem() -> (GraphState, Tensor) {
        let mut state = GraphState::new();
        let w = state.add_variable("w", &[2], true).unwrap();
        state.add_initializer("w", Initializer::Zeros, 2, 2).unwrap();
        state.add_variable("frozen", &[2], false).unwrap();
        let loss = w.square().sum();
        (state, loss)
    }

    /// Compiles `optimizer`, initializes everything and runs `steps` training steps.
    pub(crate) fn run_steps(optimizer: &Optimizer, steps: usize) -> (GraphState, ArrayD<f32>) {
        let (mut state, loss) = quadratic_problem();
        let targets = optimizer.prepare_targets(&mut state, &loss).unwrap();
        let ids: Vec<usize> = targets.iter().map(|t| t.node_id).collect();
        state.run_initializers().unwrap();
        state.set_value("w", array![1.0f32, -2.0].into_dyn()).unwrap();
        state.set_value("frozen", array![5.0f32, 5.0].into_dyn()).unwrap();
        state.run_optimizer_initializers().unwrap();
        for _ in 0..steps {
            state.run(&HashMap::new(), &[], &ids, true).unwrap();
        }
        let w = state.value("w").unwrap();
        (state, w)
    }

    pub(crate) fn assert_close(actual: &ArrayD<f32>, expected: &[f32], tolerance: f32) {
        let values: Vec<f32> = actual.iter().copied().collect();
        assert_eq!(values.len(), expected.len());
        for (a, e) in values.iter().zip(expected) {
            assert!((a - e).abs() <= tolerance, "{:?} != {:?}", values, expected);
        }
    }

    #[test]
    fn test_sgd_step_and_frozen_variables() {
        let (state, w) = run_steps(&Optimizer::sgd(0.1).unwrap(), 1);
        assert_close(&w, &[0.8, -1.6], 1e-6);
        assert_eq!(state.value("frozen").unwrap(), array![5.0f32, 5.0].into_dyn());
        assert!(state.optimizer_variables().is_empty());
    }

    #[test]
    fn test_clip_by_value_bounds_the_gradient() {
        let optimizer = Optimizer::sgd(0.1)
            .unwrap()
            .with_clip_gradient(ClipGradient::ByValue { clip_value: 1.0 });
        let (_, w) = run_steps(&optimizer, 1);
        assert_close(&w, &[0.9, -1.9], 1e-6);
    }

    #[test]
    fn test_clip_by_norm_is_refused() {
        let optimizer = Optimizer::sgd(0.1)
            .unwrap()
            .with_clip_gradient(ClipGradient::ByNorm { clip_norm: 1.0 });
        let (mut state, loss) = quadratic_problem();
        assert!(matches!(optimizer.prepare_targets(&mut state, &loss), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_every_declared_slot_exists_after_compile() {
        let optimizers = vec![
            Optimizer::new(Momentum::default()).unwrap(),
            Optimizer::adam(),
            Optimizer::new(Adamax::default()).unwrap(),
            Optimizer::new(AdaGrad::default()).unwrap(),
            Optimizer::new(AdaDelta::default()).unwrap(),
            Optimizer::new(RmsProp::default().centered()).unwrap(),
        ];
        for optimizer in optimizers {
            let (mut state, loss) = quadratic_problem();
            optimizer.prepare_targets(&mut state, &loss).unwrap();
            for slot in optimizer.slot_names() {
                assert!(state.get_slot("w", slot).is_ok(), "{} slot {}", optimizer.name(), slot);
                assert!(state.get_slot("frozen", slot).is_err());
                assert!(state.is_optimizer_variable(&slot_variable_name("w", slot)));
            }
            assert!(matches!(state.get_slot("w", "no_such_slot"), Err(Error::MissingSlot { .. })));
        }
    }

    #[test]
    fn test_optimizer_config_round_trips_through_json() {
        let optimizer = Optimizer::new(Momentum::new(0.01, 0.9, false))
            .unwrap()
            .with_clip_gradient(ClipGradient::ByValue { clip_value: 0.5 });
        let json = serde_json::to_string(&optimizer).unwrap();
        let back: Optimizer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, optimizer);
    }
}
