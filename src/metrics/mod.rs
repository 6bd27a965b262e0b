//! Metrics for monitoring model quality.
//!
//! Metrics are evaluated in-graph on the prediction op of the model (the
//! softmax of the logits when the loss works on logits), once per batch.
//! Batch values are aggregated with [`WeightedMean`], weighted by the actual
//! size of each batch.

use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;

const LOG_EPSILON: f32 = 1e-5;
const SMALL_EPSILON: f32 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    /// Share of examples whose arg-max prediction matches the arg-max label.
    Accuracy,
    Mae,
    Mse,
    Msle,
    Mape,
}

impl MetricKind {
    /// Scalar metric value of one batch.
    pub fn apply(&self, y_pred: &Tensor, y_true: &Tensor) -> Tensor {
        match self {
            MetricKind::Accuracy => y_pred.argmax().equal(&y_true.argmax()).mean_all(),
            MetricKind::Mae => (y_pred - y_true).abs().mean_all(),
            MetricKind::Mse => (y_pred - y_true).square().mean_all(),
            MetricKind::Msle => {
                let first = y_pred.maximum_scalar(LOG_EPSILON).add_scalar(1.0).log();
                let second = y_true.maximum_scalar(LOG_EPSILON).add_scalar(1.0).log();
                (&first - &second).square().mean_all()
            }
            MetricKind::Mape => {
                let denom = y_true.abs().maximum_scalar(SMALL_EPSILON);
                (&(y_true - y_pred) / &denom).abs().mul_scalar(100.0).mean_all()
            }
        }
    }

    /// Whether larger values are better; used by early stopping in `Auto` mode.
    pub fn higher_is_better(&self) -> bool {
        matches!(self, MetricKind::Accuracy)
    }

    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::Accuracy => "accuracy",
            MetricKind::Mae => "mae",
            MetricKind::Mse => "mse",
            MetricKind::Msle => "msle",
            MetricKind::Mape => "mape",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Running mean of per-batch values weighted by batch size.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WeightedMean {
    sum: f64,
    weight: usize,
}

impl WeightedMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, weight: usize) {
        self.sum += value * weight as f64;
        self.weight += weight;
    }

    /// Zero when nothing was recorded.
    pub fn compute(&self) -> f64 {
        if self.weight == 0 {
            0.0
        } else {
            self.sum / self.weight as f64
        }
    }

    pub fn count(&self) -> usize {
        self.weight
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
