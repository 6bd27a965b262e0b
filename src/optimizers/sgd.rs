//! Plain and momentum gradient descent.

use super::{GradientApplying, Update};
use crate::error::{Error, Result};
use crate::initializers::Initializer;
use crate::state::{slot_variable_name, GraphState};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

const MOMENTUM: &str = "momentum";

pub(crate) fn check_learning_rate(learning_rate: f32) -> Result<()> {
    if !(learning_rate >= 0.0) {
        return Err(Error::config(format!("Learning rate {} should be >= 0.0.", learning_rate)));
    }
    Ok(())
}

/// `w -= lr * g`. Allocates no slots.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    pub learning_rate: f32,
}

impl Default for Sgd {
    fn default() -> Self {
        Self { learning_rate: 0.2 }
    }
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl GradientApplying for Sgd {
    fn name(&self) -> &'static str {
        "SGD"
    }

    fn validate(&self) -> Result<()> {
        check_learning_rate(self.learning_rate)
    }

    fn apply_gradient(&self, _state: &GraphState, variable: &str, value: &Tensor, gradient: &Tensor) -> Result<Vec<Update>> {
        Ok(vec![(variable.to_string(), value - &gradient.mul_scalar(self.learning_rate))])
    }
}

/// Gradient descent with a momentum accumulator.
///
/// `accum = momentum * accum + g`, then `w -= lr * accum`, or with Nesterov
/// `w -= lr * g + lr * momentum * accum`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Momentum {
    pub learning_rate: f32,
    pub momentum: f32,
    pub use_nesterov: bool,
}

impl Default for Momentum {
    fn default() -> Self {
        Self { learning_rate: 0.001, momentum: 0.99, use_nesterov: true }
    }
}

impl Momentum {
    pub fn new(learning_rate: f32, momentum: f32, use_nesterov: bool) -> Self {
        Self { learning_rate, momentum, use_nesterov }
    }
}

impl GradientApplying for Momentum {
    fn name(&self) -> &'static str {
        "Momentum"
    }

    fn validate(&self) -> Result<()> {
        check_learning_rate(self.learning_rate)?;
        if !(self.momentum >= 0.0) {
            return Err(Error::config(format!("Momentum {} should be >= 0.0.", self.momentum)));
        }
        Ok(())
    }

    fn slot_names(&self) -> Vec<&'static str> {
        vec![MOMENTUM]
    }

    fn create_slots(&self, state: &mut GraphState, variables: &[String]) -> Result<()> {
        for variable in variables {
            state.create_slot(variable, MOMENTUM, Initializer::Zeros)?;
        }
        Ok(())
    }

    fn apply_gradient(&self, state: &GraphState, variable: &str, value: &Tensor, gradient: &Tensor) -> Result<Vec<Update>> {
        let accum = state.get_slot(variable, MOMENTUM)?;
        let accum_new = &accum.mul_scalar(self.momentum) + gradient;
        let step = if self.use_nesterov {
            &gradient.mul_scalar(self.learning_rate) + &accum_new.mul_scalar(self.learning_rate * self.momentum)
        } else {
            accum_new.mul_scalar(self.learning_rate)
        };
        Ok(vec![
            (slot_variable_name(variable, MOMENTUM), accum_new),
            (variable.to_string(), value - &step),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizers::tests::{assert_close, run_steps};
    use crate::optimizers::Optimizer;

    #[test]
    fn test_momentum_accumulates_across_steps() {
        let optimizer = Optimizer::new(Momentum::new(0.1, 0.5, false)).unwrap();
        let (state, w) = run_steps(&optimizer, 2);
        // step 1: g = 2w = [2, -4], accum = g, w = [0.8, -1.6]
        // step 2: g = [1.6, -3.2], accum = [2.6, -5.2], w = [0.54, -1.08]
        assert_close(&w, &[0.54, -1.08], 1e-5);
        assert_close(&state.value("optimizer_w-momentum").unwrap(), &[2.6, -5.2], 1e-5);
    }

    #[test]
    fn test_nesterov_looks_ahead() {
        let optimizer = Optimizer::new(Momentum::new(0.1, 0.5, true)).unwrap();
        let (_, w) = run_steps(&optimizer, 1);
        // w -= 0.1 * g + 0.05 * accum, accum = g
        assert_close(&w, &[0.7, -1.4], 1e-5);
    }

    #[test]
    fn test_negative_learning_rate_is_rejected() {
        assert!(matches!(Optimizer::sgd(-1.0), Err(Error::Configuration(_))));
        assert!(Optimizer::new(Momentum::new(0.1, -0.5, false)).is_err());
    }
}
