//! Loss functions in graph paradigm.
//!
//! A loss is a [`LossKind`] (the per-element error) plus a [`Reduction`]
//! (how the element errors become one scalar). [`Loss::apply`] appends the
//! nodes computing that scalar to the graph of its operands.
//!
//! # Available Loss Functions
//!
//! - **MSE / MAE**: squared and absolute error
//! - **MAPE / MSLE**: percentage and squared-log errors
//! - **Poisson**: `y_pred - y_true * log(y_pred)`
//! - **Hinge / SquaredHinge**: margins over `{0, 1}` labels remapped to `{-1, 1}`
//! - **Huber**: quadratic near zero, linear beyond `delta`
//! - **LogCosh**: `log(cosh(y_pred - y_true))`
//! - **BinaryCrossentropy**: log loss over probabilities
//! - **SoftmaxCrossEntropyWithLogits**: categorical log loss over raw logits

use crate::error::{Error, Result};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Guards the denominator of MAPE and the logs of binary cross-entropy.
const SMALL_EPSILON: f32 = 1e-7;
/// Guards the logs of MSLE and Poisson.
const LOG_EPSILON: f32 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Reduction {
    /// Sum of every element error divided by the number of losses (label elements).
    #[default]
    SumOverBatchSize,
    /// Mean over the last axis, then sum over everything else.
    SumOverBatch,
    /// Sum of every element error; the number of losses is ignored.
    RawSum,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LossKind {
    Mse,
    Mae,
    Mape,
    Msle,
    Poisson,
    Hinge,
    SquaredHinge,
    Huber { delta: f32 },
    LogCosh,
    BinaryCrossentropy,
    SoftmaxCrossEntropyWithLogits,
}

impl LossKind {
    /// Elementwise error, same shape as the prediction.
    ///
    /// Returns `None` for losses that reduce on their own.
    fn element_errors(&self, y_pred: &Tensor, y_true: &Tensor) -> Option<Tensor> {
        let errors = match *self {
            LossKind::Mse => (y_pred - y_true).square(),
            LossKind::Mae => (y_pred - y_true).abs(),
            LossKind::Mape => {
                let denom = y_true.abs().maximum_scalar(SMALL_EPSILON);
                (&(y_true - y_pred) / &denom).abs().mul_scalar(100.0)
            }
            LossKind::Msle => {
                let first = y_pred.maximum_scalar(LOG_EPSILON).add_scalar(1.0).log();
                let second = y_true.maximum_scalar(LOG_EPSILON).add_scalar(1.0).log();
                (&first - &second).square()
            }
            LossKind::Poisson => y_pred - &(y_true * &y_pred.add_scalar(LOG_EPSILON).log()),
            LossKind::Hinge => hinge_margins(y_pred, y_true),
            LossKind::SquaredHinge => hinge_margins(y_pred, y_true).square(),
            LossKind::Huber { delta } => {
                let abs_error = (y_pred - y_true).abs();
                let quadratic = abs_error.minimum_scalar(delta);
                let linear = &abs_error - &quadratic;
                &quadratic.square().mul_scalar(0.5) + &linear.mul_scalar(delta)
            }
            LossKind::LogCosh => {
                let diff = y_pred - y_true;
                let softplus = diff.mul_scalar(-2.0).softplus();
                (&diff + &softplus).add_scalar(-std::f32::consts::LN_2)
            }
            LossKind::BinaryCrossentropy => {
                let clipped = y_pred.clip(SMALL_EPSILON, 1.0 - SMALL_EPSILON);
                let positive = y_true * &clipped.add_scalar(SMALL_EPSILON).log();
                let negative =
                    &clipped.rsub_scalar(1.0).add_scalar(SMALL_EPSILON).log() * &y_true.rsub_scalar(1.0);
                -&(&positive + &negative)
            }
            LossKind::SoftmaxCrossEntropyWithLogits => return None,
        };
        Some(errors)
    }

    /// Whether the prediction op is `softmax(output)` rather than the output itself.
    pub fn expects_logits(&self) -> bool {
        matches!(self, LossKind::SoftmaxCrossEntropyWithLogits)
    }
}

/// `max(1 - (2 y_true - 1) * y_pred, 0)`
fn hinge_margins(y_pred: &Tensor, y_true: &Tensor) -> Tensor {
    let labels = y_true.mul_scalar(2.0).add_scalar(-1.0);
    (&labels * y_pred).rsub_scalar(1.0).maximum_scalar(0.0)
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossKind::Huber { delta } => write!(f, "Huber(delta={})", delta),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Loss {
    pub kind: LossKind,
    #[serde(default)]
    pub reduction: Reduction,
}

impl From<LossKind> for Loss {
    fn from(kind: LossKind) -> Self {
        Loss::new(kind)
    }
}

impl Loss {
    pub fn new(kind: LossKind) -> Self {
        Self { kind, reduction: Reduction::default() }
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let LossKind::Huber { delta } = self.kind {
            if !(delta > 0.0) {
                return Err(Error::config(format!("Huber delta must be positive, got {}", delta)));
            }
        }
        Ok(())
    }

    /// Whether [`Loss::apply`] needs the number of losses.
    pub fn requires_number_of_losses(&self) -> bool {
        !self.kind.expects_logits() && self.reduction == Reduction::SumOverBatchSize
    }

    /// Builds the scalar loss of `y_pred` against `y_true`.
    ///
    /// `number_of_losses` is the element count of the labels of the batch;
    /// it is required by [`Reduction::SumOverBatchSize`].
    pub fn apply(&self, y_pred: &Tensor, y_true: &Tensor, number_of_losses: Option<&Tensor>) -> Result<Tensor> {
        let errors = match self.kind.element_errors(y_pred, y_true) {
            Some(errors) => errors,
            // Mean of the per-example cross entropy over the batch.
            None => return Ok(y_pred.softmax_cross_entropy(y_true).mean_all()),
        };
        match self.reduction {
            Reduction::SumOverBatchSize => {
                let n = number_of_losses.ok_or_else(|| {
                    Error::config(format!(
                        "{} with reduction {:?} requires the number of losses",
                        self.kind, self.reduction
                    ))
                })?;
                Ok(&errors.sum() / n)
            }
            Reduction::SumOverBatch => Ok(errors.mean().sum()),
            Reduction::RawSum => Ok(errors.sum()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::cpu_backend::CpuBackend;
    use crate::runtime::session::Session;
    use crate::shape::TensorShape;
    use crate::tensor::GraphContext;
    use ndarray::{Array, ArrayD, IxDyn};
    use std::collections::HashMap;

    const EPS: f32 = 1e-2;

    fn matrix(rows: usize, cols: usize, values: &[f32]) -> ArrayD<f32> {
        Array::from_shape_vec(IxDyn(&[rows, cols]), values.to_vec()).unwrap()
    }

    /// Evaluates `loss(y_pred, y_true)` with the label element count as the number of losses.
    fn eval(loss: Loss, y_pred: ArrayD<f32>, y_true: ArrayD<f32>, with_n: bool) -> Result<f32> {
        let ctx = GraphContext::shared();
        let cols = y_pred.shape()[1];
        let p = Tensor::new_input(&ctx, "y_pred", TensorShape::with_unknown_batch(&[cols]));
        let t = Tensor::new_input(&ctx, "y_true", TensorShape::with_unknown_batch(&[cols]));
        let n = t.size();
        let out = loss.apply(&p, &t, with_n.then_some(&n))?;
        let asg = ctx.borrow().main_graph().clone();
        let feeds = HashMap::from([(p.node_id, y_pred), (t.node_id, y_true)]);
        let mut session = Session::new(CpuBackend::new());
        let values = session.run(&asg, &feeds, &[out.node_id], &[], false)?;
        Ok(values[0].iter().copied().next().unwrap_or(f32::NAN))
    }

    fn y_true() -> ArrayD<f32> {
        matrix(2, 3, &[0.0, 2.0, 3.0, 4.0, 5.0, 6.0])
    }

    #[test]
    fn test_identical_inputs_hit_the_fixed_point() {
        for kind in [LossKind::Mse, LossKind::Mae, LossKind::Huber { delta: 1.0 }, LossKind::LogCosh, LossKind::Msle] {
            let value = eval(Loss::new(kind), y_true(), y_true(), true).unwrap();
            assert!(value.abs() < 1e-5, "{} gave {}", kind, value);
        }
        let poisson = eval(Loss::new(LossKind::Poisson), y_true(), y_true(), true).unwrap();
        assert!((poisson - (-1.504_184_2)).abs() < EPS, "poisson = {}", poisson);
    }

    #[test]
    fn test_huber_reductions() {
        let t = matrix(2, 3, &[0.9, 0.2, 0.2, 0.8, 0.4, 0.6]);
        let p = matrix(2, 3, &[1.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
        let huber = Loss::new(LossKind::Huber { delta: 1.0 });

        let mean = eval(huber, p.clone(), t.clone(), true).unwrap();
        assert!((mean - 0.104_166_68).abs() < 1e-5);

        let summed = eval(huber.with_reduction(Reduction::SumOverBatch), p, t, false).unwrap();
        assert!((summed - 0.208_333_34).abs() < 1e-5);
    }

    #[test]
    fn test_hinge_remaps_binary_labels() {
        let t = matrix(2, 4, &[0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0]);
        let p = matrix(2, 4, &[-0.3, 0.2, -0.1, 1.6, -0.25, -1.0, 0.5, 0.6]);
        let value = eval(Loss::new(LossKind::Hinge), p, t, true).unwrap();
        assert!((value - 0.506_25).abs() < 1e-5);
    }

    #[test]
    fn test_mse_and_mape_values() {
        let p = matrix(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mse = eval(Loss::new(LossKind::Mse), p.clone(), y_true(), true).unwrap();
        assert!((mse - 1.0 / 6.0).abs() < 1e-6);

        let raw = eval(Loss::new(LossKind::Mse).with_reduction(Reduction::RawSum), p, y_true(), false).unwrap();
        assert!((raw - 1.0).abs() < 1e-6);

        let t = matrix(1, 2, &[2.0, 4.0]);
        let p = matrix(1, 2, &[1.0, 5.0]);
        let mape = eval(Loss::new(LossKind::Mape), p, t, true).unwrap();
        assert!((mape - 37.5).abs() < 1e-4);
    }

    #[test]
    fn test_binary_crossentropy_is_finite_at_the_edges() {
        let t = matrix(1, 2, &[1.0, 0.0]);
        let p = matrix(1, 2, &[0.0, 1.0]);
        let value = eval(Loss::new(LossKind::BinaryCrossentropy), p, t, true).unwrap();
        assert!(value.is_finite());
        assert!(value > 10.0);
    }

    #[test]
    fn test_softmax_cross_entropy_is_mean_over_batch() {
        let logits = matrix(2, 2, &[0.0, 0.0, 0.0, 0.0]);
        let labels = matrix(2, 2, &[1.0, 0.0, 0.0, 1.0]);
        let value = eval(Loss::new(LossKind::SoftmaxCrossEntropyWithLogits), logits, labels, false).unwrap();
        assert!((value - std::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn test_missing_number_of_losses_is_an_error() {
        let err = eval(Loss::new(LossKind::Mse), y_true(), y_true(), false);
        assert!(matches!(err, Err(Error::Configuration(_))));
        assert!(!Loss::new(LossKind::SoftmaxCrossEntropyWithLogits).requires_number_of_losses());
    }

    #[test]
    fn test_huber_delta_is_validated() {
        assert!(Loss::new(LossKind::Huber { delta: 0.0 }).validate().is_err());
        assert!(Loss::new(LossKind::Huber { delta: 1.5 }).validate().is_ok());
    }
}
