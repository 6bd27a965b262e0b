//! Weight penalties added to the training loss.

use crate::error::{Error, Result};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Regularizer {
    L1 { l1: f32 },
    L2 { l2: f32 },
    L1L2 { l1: f32, l2: f32 },
}

impl Regularizer {
    pub fn validate(&self) -> Result<()> {
        let (l1, l2) = self.factors();
        if !(l1 >= 0.0 && l2 >= 0.0) {
            return Err(Error::config(format!(
                "regularization factors must be non-negative, got l1 = {}, l2 = {}",
                l1, l2
            )));
        }
        Ok(())
    }

    fn factors(&self) -> (f32, f32) {
        match *self {
            Regularizer::L1 { l1 } => (l1, 0.0),
            Regularizer::L2 { l2 } => (0.0, l2),
            Regularizer::L1L2 { l1, l2 } => (l1, l2),
        }
    }

    /// Scalar penalty `l1 * sum(|w|) + l2 * sum(w^2)`.
    pub fn apply(&self, weights: &Tensor) -> Tensor {
        let (l1, l2) = self.factors();
        let l1_term = (l1 != 0.0).then(|| weights.abs().sum().mul_scalar(l1));
        let l2_term = (l2 != 0.0).then(|| weights.square().sum().mul_scalar(l2));
        match (l1_term, l2_term) {
            (Some(a), Some(b)) => &a + &b,
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => weights.sum().mul_scalar(0.0),
        }
    }
}
