//! Optimizers with per-element adaptive step sizes.

use super::sgd::check_learning_rate;
use super::{GradientApplying, Update};
use crate::error::{Error, Result};
use crate::initializers::Initializer;
use crate::state::{slot_variable_name, GraphState};
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

const FIRST_MOMENT: &str = "m";
const SECOND_MOMENT: &str = "v";
const ACCUMULATOR: &str = "accumulator";
const ACCUM: &str = "accum";
const ACCUM_UPDATE: &str = "accum_update";
const RMS: &str = "rms";
const MOMENTUM: &str = "momentum";
const MEAN_GRADIENT: &str = "mg";

pub const BETA1_POWER: &str = "optimizer_beta1_power";
pub const BETA2_POWER: &str = "optimizer_beta2_power";

fn check_open_unit(what: &str, value: f32) -> Result<()> {
    if !(value > 0.0 && value < 1.0) {
        return Err(Error::config(format!("{} {} should be in range (0.0; 1.0).", what, value)));
    }
    Ok(())
}

fn check_non_negative(what: &str, value: f32) -> Result<()> {
    if !(value >= 0.0) {
        return Err(Error::config(format!("{} {} should be >= 0.0.", what, value)));
    }
    Ok(())
}

fn create_slots_for(state: &mut GraphState, variables: &[String], slots: &[(&str, Initializer)]) -> Result<()> {
    for variable in variables {
        for (slot, initializer) in slots {
            state.create_slot(variable, slot, initializer.clone())?;
        }
    }
    Ok(())
}

/// Adam with bias correction through the `beta1_power` / `beta2_power` accumulators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    #[serde(default)]
    pub use_nesterov: bool,
}

impl Default for Adam {
    fn default() -> Self {
        Self { learning_rate: 0.001, beta1: 0.9, beta2: 0.999, epsilon: 1e-7, use_nesterov: false }
    }
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self { learning_rate, beta1, beta2, epsilon, use_nesterov: false }
    }
}

impl GradientApplying for Adam {
    fn name(&self) -> &'static str {
        "Adam"
    }

    fn validate(&self) -> Result<()> {
        check_learning_rate(self.learning_rate)?;
        check_open_unit("Beta1", self.beta1)?;
        check_open_unit("Beta2", self.beta2)?;
        check_non_negative("Epsilon", self.epsilon)
    }

    fn slot_names(&self) -> Vec<&'static str> {
        vec![FIRST_MOMENT, SECOND_MOMENT]
    }

    fn create_slots(&self, state: &mut GraphState, variables: &[String]) -> Result<()> {
        create_slots_for(state, variables, &[(FIRST_MOMENT, Initializer::Zeros), (SECOND_MOMENT, Initializer::Zeros)])?;
        state.add_optimizer_variable(BETA1_POWER, &[], Initializer::constant(self.beta1))?;
        state.add_optimizer_variable(BETA2_POWER, &[], Initializer::constant(self.beta2))?;
        Ok(())
    }

    fn apply_gradient(&self, state: &GraphState, variable: &str, value: &Tensor, gradient: &Tensor) -> Result<Vec<Update>> {
        let m = state.get_slot(variable, FIRST_MOMENT)?;
        let v = state.get_slot(variable, SECOND_MOMENT)?;
        let beta1_power = state.variable_tensor(BETA1_POWER)?;
        let beta2_power = state.variable_tensor(BETA2_POWER)?;

        let m_new = &m.mul_scalar(self.beta1) + &gradient.mul_scalar(1.0 - self.beta1);
        let v_new = &v.mul_scalar(self.beta2) + &gradient.square().mul_scalar(1.0 - self.beta2);
        // lr * sqrt(1 - beta2^t) / (1 - beta1^t)
        let lr_t = &beta2_power.rsub_scalar(1.0).sqrt().mul_scalar(self.learning_rate) / &beta1_power.rsub_scalar(1.0);
        let direction = if self.use_nesterov {
            &m_new.mul_scalar(self.beta1) + &gradient.mul_scalar(1.0 - self.beta1)
        } else {
            m_new.clone()
        };
        let step = &(&lr_t * &direction) / &v_new.sqrt().add_scalar(self.epsilon);
        Ok(vec![
            (slot_variable_name(variable, FIRST_MOMENT), m_new),
            (slot_variable_name(variable, SECOND_MOMENT), v_new),
            (variable.to_string(), value - &step),
        ])
    }

    fn finish(&self, state: &GraphState) -> Result<Vec<Update>> {
        Ok(vec![
            (BETA1_POWER.to_string(), state.variable_tensor(BETA1_POWER)?.mul_scalar(self.beta1)),
            (BETA2_POWER.to_string(), state.variable_tensor(BETA2_POWER)?.mul_scalar(self.beta2)),
        ])
    }
}

/// Adam variant using the infinity norm: `v = max(beta2 * v, |g|)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adamax {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for Adamax {
    fn default() -> Self {
        Self { learning_rate: 0.001, beta1: 0.9, beta2: 0.999, epsilon: 1e-7 }
    }
}

impl GradientApplying for Adamax {
    fn name(&self) -> &'static str {
        "Adamax"
    }

    fn validate(&self) -> Result<()> {
        check_learning_rate(self.learning_rate)?;
        check_open_unit("Beta1", self.beta1)?;
        check_open_unit("Beta2", self.beta2)?;
        check_non_negative("Epsilon", self.epsilon)
    }

    fn slot_names(&self) -> Vec<&'static str> {
        vec![FIRST_MOMENT, SECOND_MOMENT]
    }

    fn create_slots(&self, state: &mut GraphState, variables: &[String]) -> Result<()> {
        create_slots_for(state, variables, &[(FIRST_MOMENT, Initializer::Zeros), (SECOND_MOMENT, Initializer::Zeros)])?;
        state.add_optimizer_variable(BETA1_POWER, &[], Initializer::constant(self.beta1))?;
        Ok(())
    }

    fn apply_gradient(&self, state: &GraphState, variable: &str, value: &Tensor, gradient: &Tensor) -> Result<Vec<Update>> {
        let m = state.get_slot(variable, FIRST_MOMENT)?;
        let v = state.get_slot(variable, SECOND_MOMENT)?;
        let beta1_power = state.variable_tensor(BETA1_POWER)?;

        let m_new = &m.mul_scalar(self.beta1) + &gradient.mul_scalar(1.0 - self.beta1);
        let v_new = v.mul_scalar(self.beta2).maximum(&gradient.abs());
        // lr / (1 - beta1^t) * m / (v + eps)
        let step = &(&m_new.mul_scalar(self.learning_rate) / &beta1_power.rsub_scalar(1.0))
            / &v_new.add_scalar(self.epsilon);
        Ok(vec![
            (slot_variable_name(variable, FIRST_MOMENT), m_new),
            (slot_variable_name(variable, SECOND_MOMENT), v_new),
            (variable.to_string(), value - &step),
        ])
    }

    fn finish(&self, state: &GraphState) -> Result<Vec<Update>> {
        Ok(vec![(BETA1_POWER.to_string(), state.variable_tensor(BETA1_POWER)?.mul_scalar(self.beta1))])
    }
}

/// `accum += g^2`, `w -= lr * g / sqrt(accum)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaGrad {
    pub learning_rate: f32,
    pub initial_accumulator_value: f32,
}

impl Default for AdaGrad {
    fn default() -> Self {
        Self { learning_rate: 0.1, initial_accumulator_value: 0.01 }
    }
}

impl GradientApplying for AdaGrad {
    fn name(&self) -> &'static str {
        "AdaGrad"
    }

    fn validate(&self) -> Result<()> {
        check_learning_rate(self.learning_rate)?;
        check_non_negative("Initial accumulator value", self.initial_accumulator_value)
    }

    fn slot_names(&self) -> Vec<&'static str> {
        vec![ACCUMULATOR]
    }

    fn create_slots(&self, state: &mut GraphState, variables: &[String]) -> Result<()> {
        create_slots_for(state, variables, &[(ACCUMULATOR, Initializer::constant(self.initial_accumulator_value))])
    }

    fn apply_gradient(&self, state: &GraphState, variable: &str, value: &Tensor, gradient: &Tensor) -> Result<Vec<Update>> {
        let accum = state.get_slot(variable, ACCUMULATOR)?;
        let accum_new = &accum + &gradient.square();
        let step = &gradient.mul_scalar(self.learning_rate) / &accum_new.sqrt();
        Ok(vec![
            (slot_variable_name(variable, ACCUMULATOR), accum_new),
            (variable.to_string(), value - &step),
        ])
    }
}

/// AdaDelta with running averages of squared gradients and squared updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdaDelta {
    pub learning_rate: f32,
    pub rho: f32,
    pub epsilon: f32,
}

impl Default for AdaDelta {
    fn default() -> Self {
        Self { learning_rate: 0.1, rho: 0.95, epsilon: 1e-8 }
    }
}

impl GradientApplying for AdaDelta {
    fn name(&self) -> &'static str {
        "AdaDelta"
    }

    fn validate(&self) -> Result<()> {
        check_learning_rate(self.learning_rate)?;
        check_non_negative("Rho", self.rho)?;
        check_non_negative("Epsilon", self.epsilon)
    }

    fn slot_names(&self) -> Vec<&'static str> {
        vec![ACCUM, ACCUM_UPDATE]
    }

    fn create_slots(&self, state: &mut GraphState, variables: &[String]) -> Result<()> {
        create_slots_for(state, variables, &[(ACCUM, Initializer::Zeros), (ACCUM_UPDATE, Initializer::Zeros)])
    }

    fn apply_gradient(&self, state: &GraphState, variable: &str, value: &Tensor, gradient: &Tensor) -> Result<Vec<Update>> {
        let accum = state.get_slot(variable, ACCUM)?;
        let accum_update = state.get_slot(variable, ACCUM_UPDATE)?;

        let accum_new = &accum.mul_scalar(self.rho) + &gradient.square().mul_scalar(1.0 - self.rho);
        let scale = &accum_update.add_scalar(self.epsilon).sqrt() / &accum_new.add_scalar(self.epsilon).sqrt();
        let update = &scale * gradient;
        let accum_update_new = &accum_update.mul_scalar(self.rho) + &update.square().mul_scalar(1.0 - self.rho);
        Ok(vec![
            (slot_variable_name(variable, ACCUM), accum_new),
            (slot_variable_name(variable, ACCUM_UPDATE), accum_update_new),
            (variable.to_string(), value - &update.mul_scalar(self.learning_rate)),
        ])
    }
}

/// RMSProp, optionally centered (normalized by the gradient variance estimate).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RmsProp {
    pub learning_rate: f32,
    pub decay: f32,
    pub momentum: f32,
    pub epsilon: f32,
    pub centered: bool,
}

impl Default for RmsProp {
    fn default() -> Self {
        Self { learning_rate: 0.001, decay: 0.9, momentum: 0.0, epsilon: 1e-10, centered: false }
    }
}

impl RmsProp {
    pub fn centered(mut self) -> Self {
        self.centered = true;
        self
    }
}

impl GradientApplying for RmsProp {
    fn name(&self) -> &'static str {
        "RMSProp"
    }

    fn validate(&self) -> Result<()> {
        check_learning_rate(self.learning_rate)?;
        check_non_negative("Decay", self.decay)?;
        check_non_negative("Momentum", self.momentum)?;
        check_non_negative("Epsilon", self.epsilon)
    }

    fn slot_names(&self) -> Vec<&'static str> {
        if self.centered {
            vec![RMS, MOMENTUM, MEAN_GRADIENT]
        } else {
            vec![RMS, MOMENTUM]
        }
    }

    fn create_slots(&self, state: &mut GraphState, variables: &[String]) -> Result<()> {
        let mut slots = vec![(RMS, Initializer::Ones), (MOMENTUM, Initializer::Zeros)];
        if self.centered {
            slots.push((MEAN_GRADIENT, Initializer::Zeros));
        }
        create_slots_for(state, variables, &slots)
    }

    fn apply_gradient(&self, state: &GraphState, variable: &str, value: &Tensor, gradient: &Tensor) -> Result<Vec<Update>> {
        let rms = state.get_slot(variable, RMS)?;
        let momentum = state.get_slot(variable, MOMENTUM)?;

        let rms_new = &rms.mul_scalar(self.decay) + &gradient.square().mul_scalar(1.0 - self.decay);
        let mut updates = Vec::with_capacity(4);
        let denom = if self.centered {
            let mg = state.get_slot(variable, MEAN_GRADIENT)?;
            let mg_new = &mg.mul_scalar(self.decay) + &gradient.mul_scalar(1.0 - self.decay);
            let denom = (&rms_new - &mg_new.square()).add_scalar(self.epsilon).sqrt();
            updates.push((slot_variable_name(variable, MEAN_GRADIENT), mg_new));
            denom
        } else {
            rms_new.add_scalar(self.epsilon).sqrt()
        };
        let momentum_new =
            &momentum.mul_scalar(self.momentum) + &(&gradient.mul_scalar(self.learning_rate) / &denom);
        updates.push((variable.to_string(), value - &momentum_new));
        updates.push((slot_variable_name(variable, RMS), rms_new));
        updates.push((slot_variable_name(variable, MOMENTUM), momentum_new));
        Ok(updates)
    }
}
