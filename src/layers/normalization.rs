//! Batch normalization over the last (channel) axis.
//!
//! Training runs normalize with the statistics of the current batch and fold
//! them into the moving mean and variance; every other run normalizes with the
//! moving statistics. A frozen layer always uses the moving statistics and
//! never updates them.

use super::basic::define_parameter;
use super::{single, ForwardBuilding, ShapeInferable, VariableOwning};
use crate::error::{Error, Result};
use crate::initializers::Initializer;
use crate::shape::TensorShape;
use crate::state::GraphState;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

pub fn gamma_name(layer: &str) -> String {
    format!("{}_batch_norm_gamma", layer)
}

pub fn beta_name(layer: &str) -> String {
    format!("{}_batch_norm_beta", layer)
}

pub fn moving_mean_name(layer: &str) -> String {
    format!("{}_batch_norm_moving_mean", layer)
}

pub fn moving_variance_name(layer: &str) -> String {
    format!("{}_batch_norm_moving_variance", layer)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNorm {
    /// Weight of the old moving statistics in each update.
    pub momentum: f32,
    pub epsilon: f32,
    /// Learn an offset `beta`.
    pub center: bool,
    /// Learn a scale `gamma`.
    pub scale: bool,
    pub gamma_initializer: Initializer,
    pub beta_initializer: Initializer,
    pub moving_mean_initializer: Initializer,
    pub moving_variance_initializer: Initializer,
}

impl Default for BatchNorm {
    fn default() -> Self {
        Self {
            momentum: 0.99,
            epsilon: 0.001,
            center: true,
            scale: true,
            gamma_initializer: Initializer::Ones,
            beta_initializer: Initializer::Zeros,
            moving_mean_initializer: Initializer::Zeros,
            moving_variance_initializer: Initializer::Ones,
        }
    }
}

/// Variable handles of a built layer by role.
struct Parameters<'a> {
    gamma: Option<&'a Tensor>,
    beta: Option<&'a Tensor>,
    moving_mean: &'a Tensor,
    moving_variance: &'a Tensor,
}

impl BatchNorm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn without_center(mut self) -> Self {
        self.center = false;
        self
    }

    pub fn without_scale(mut self) -> Self {
        self.scale = false;
        self
    }

    pub(crate) fn validate(&self, layer: &str) -> Result<()> {
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(Error::config(format!(
                "BatchNorm '{}': momentum must be in [0, 1), got {}",
                layer, self.momentum
            )));
        }
        if !(self.epsilon > 0.0) {
            return Err(Error::config(format!(
                "BatchNorm '{}': epsilon must be positive, got {}",
                layer, self.epsilon
            )));
        }
        for initializer in [
            &self.gamma_initializer,
            &self.beta_initializer,
            &self.moving_mean_initializer,
            &self.moving_variance_initializer,
        ] {
            initializer.validate()?;
        }
        Ok(())
    }

    fn channels(&self, layer: &str, input: &TensorShape) -> Result<usize> {
        if input.rank() < 2 {
            return Err(Error::shape(layer, format!("BatchNorm expects an input of rank >= 2, got {}", input)));
        }
        input
            .last()
            .ok_or_else(|| Error::shape(layer, format!("channel dimension of input {} is unknown", input)))
    }

    fn parameters<'a>(&self, layer: &str, variables: &'a [Tensor]) -> Result<Parameters<'a>> {
        let mut rest = variables.iter();
        let gamma = if self.scale { rest.next() } else { None };
        let beta = if self.center { rest.next() } else { None };
        match (rest.next(), rest.next()) {
            (Some(moving_mean), Some(moving_variance)) => Ok(Parameters { gamma, beta, moving_mean, moving_variance }),
            _ => Err(Error::lifecycle(format!("layer '{}' has no moving statistics", layer))),
        }
    }

    /// `gamma * (x - mean) / sqrt(variance + epsilon) + beta`
    fn normalize(&self, x: &Tensor, mean: &Tensor, variance: &Tensor, params: &Parameters<'_>) -> Tensor {
        let centered = x - mean;
        let mut out = &centered / &variance.add_scalar(self.epsilon).sqrt();
        if let Some(gamma) = params.gamma {
            out = &out * gamma;
        }
        if let Some(beta) = params.beta {
            out = &out + beta;
        }
        out
    }

    /// `momentum * moving + (1 - momentum) * batch`
    fn moving_average(&self, moving: &Tensor, batch: &Tensor) -> Tensor {
        &moving.mul_scalar(self.momentum) + &batch.mul_scalar(1.0 - self.momentum)
    }

    /// Output that switches to batch statistics in training runs, plus the
    /// `Assign` ops folding those statistics into the moving ones.
    pub(crate) fn build_training_forward(
        &self,
        layer: &str,
        trainable: bool,
        inputs: &[Tensor],
        variables: &[Tensor],
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let inference = self.build_forward(layer, inputs, variables)?;
        if !trainable {
            return Ok((inference, Vec::new()));
        }
        let x = single(layer, inputs)?;
        let params = self.parameters(layer, variables)?;

        let count = &x.size() / &x.size_of_axis(-1);
        let batch_mean = &x.reduce_sum_to(params.moving_mean) / &count;
        let deviation = x - &batch_mean;
        let batch_variance = &deviation.square().reduce_sum_to(params.moving_mean) / &count;
        let training = self.normalize(x, &batch_mean, &batch_variance, &params);

        let flag = Tensor::training_flag(&x.context);
        let output = &inference + &(&flag * &(&training - &inference));
        let updates = vec![
            self.moving_average(params.moving_mean, &batch_mean).assign_to(&moving_mean_name(layer)),
            self.moving_average(params.moving_variance, &batch_variance).assign_to(&moving_variance_name(layer)),
        ];
        Ok((output, updates))
    }
}

impl ShapeInferable for BatchNorm {
    fn compute_output_shape(&self, layer: &str, inputs: &[TensorShape]) -> Result<TensorShape> {
        let input = single(layer, inputs)?;
        self.channels(layer, input)?;
        Ok(input.clone())
    }
}

impl VariableOwning for BatchNorm {
    /// Returns gamma (with `scale`), beta (with `center`), moving mean, moving variance.
    fn define_variables(
        &self,
        layer: &str,
        trainable: bool,
        input: &TensorShape,
        state: &mut GraphState,
    ) -> Result<Vec<Tensor>> {
        let channels = self.channels(layer, input)?;
        let fans = (channels, channels);
        let mut variables = Vec::with_capacity(4);
        if self.scale {
            variables.push(define_parameter(state, &gamma_name(layer), &[channels], trainable, &self.gamma_initializer, fans, None)?);
        }
        if self.center {
            variables.push(define_parameter(state, &beta_name(layer), &[channels], trainable, &self.beta_initializer, fans, None)?);
        }
        // moving statistics are only ever written by the update ops
        variables.push(define_parameter(
            state,
            &moving_mean_name(layer),
            &[channels],
            false,
            &self.moving_mean_initializer,
            fans,
            None,
        )?);
        variables.push(define_parameter(
            state,
            &moving_variance_name(layer),
            &[channels],
            false,
            &self.moving_variance_initializer,
            fans,
            None,
        )?);
        Ok(variables)
    }

    fn param_count(&self, input: &TensorShape) -> usize {
        let channels = input.last().unwrap_or(0);
        channels * (2 + usize::from(self.scale) + usize::from(self.center))
    }
}

impl ForwardBuilding for BatchNorm {
    /// Normalizes with the moving statistics.
    fn build_forward(&self, layer: &str, inputs: &[Tensor], variables: &[Tensor]) -> Result<Tensor> {
        let x = single(layer, inputs)?;
        let params = self.parameters(layer, variables)?;
        Ok(self.normalize(x, params.moving_mean, params.moving_variance, &params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Layer, LayerKind};
    use ndarray::{array, ArrayD};
    use std::collections::HashMap;

    fn built(layer: &mut Layer, state: &mut GraphState, channels: usize) -> (Tensor, Tensor) {
        let shape = TensorShape::with_unknown_batch(&[channels]);
        layer.build(state, &[shape.clone()]).unwrap();
        let x = Tensor::new_input(state.context(), "x", shape);
        let out = layer.forward(&[x.clone()]).unwrap();
        (x, out)
    }

    #[test]
    fn test_variables_follow_the_naming_convention() {
        let mut state = GraphState::new();
        let mut layer = Layer::new(BatchNorm::new()).named("bn");
        built(&mut layer, &mut state, 3);
        assert_eq!(
            layer.variable_names(),
            &["bn_batch_norm_gamma", "bn_batch_norm_beta", "bn_batch_norm_moving_mean", "bn_batch_norm_moving_variance"]
        );
        assert_eq!(layer.param_count(), 12);
        assert_eq!(layer.type_name(), "BatchNorm");
    }

    #[test]
    fn test_moving_statistics_are_never_trainable() {
        let mut state = GraphState::new();
        let mut layer = Layer::new(BatchNorm::new()).named("bn");
        built(&mut layer, &mut state, 2);
        let trainable: Vec<&str> = state.trainable_variables().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(trainable, vec!["bn_batch_norm_gamma", "bn_batch_norm_beta"]);
        let frozen: Vec<&str> = state.frozen_variables().iter().map(|v| v.name.as_str()).collect();
        assert_eq!(frozen, vec!["bn_batch_norm_moving_mean", "bn_batch_norm_moving_variance"]);

        let mut state = GraphState::new();
        let mut layer = Layer::new(BatchNorm::new()).named("bn").frozen();
        built(&mut layer, &mut state, 2);
        assert!(state.trainable_variables().is_empty());
        assert_eq!(state.frozen_variables().len(), 4);
        assert!(layer.updates().is_empty());
    }

    #[test]
    fn test_center_and_scale_can_be_dropped() {
        let mut state = GraphState::new();
        let mut layer = Layer::new(BatchNorm::new().without_center().without_scale()).named("plain");
        built(&mut layer, &mut state, 4);
        assert_eq!(layer.variable_names(), &["plain_batch_norm_moving_mean", "plain_batch_norm_moving_variance"]);
        assert_eq!(layer.param_count(), 8);
        assert!(state.trainable_variables().is_empty());
    }

    #[test]
    fn test_training_runs_use_batch_statistics_and_update_moving_ones() {
        let mut state = GraphState::new();
        let mut layer = Layer::new(BatchNorm::new().with_momentum(0.5).with_epsilon(1e-6)).named("bn");
        let (x, out) = built(&mut layer, &mut state, 2);
        state.run_initializers().unwrap();
        let updates: Vec<usize> = layer.updates().iter().map(|t| t.node_id).collect();
        assert_eq!(updates.len(), 2);

        let batch: ArrayD<f32> = array![[1.0f32, 10.0], [3.0, 30.0]].into_dyn();
        let feeds = HashMap::from([(x.node_id, batch)]);

        // moving mean 0 and variance 1 make inference the identity up to epsilon
        let inferred = state.run(&feeds, &[out.node_id], &[], false).unwrap().remove(0);
        for (a, b) in inferred.iter().zip([1.0f32, 10.0, 3.0, 30.0]) {
            assert!((a - b).abs() < 1e-4, "{:?}", inferred);
        }

        let trained = state.run(&feeds, &[out.node_id], &updates, true).unwrap().remove(0);
        for (a, b) in trained.iter().zip([-1.0f32, -1.0, 1.0, 1.0]) {
            assert!((a - b).abs() < 1e-4, "{:?}", trained);
        }
        // batch mean [2, 20], batch variance [1, 100]
        let mean = state.value("bn_batch_norm_moving_mean").unwrap();
        assert_eq!(mean, array![1.0f32, 10.0].into_dyn());
        let variance = state.value("bn_batch_norm_moving_variance").unwrap();
        for (a, b) in variance.iter().zip([1.0f32, 50.5]) {
            assert!((a - b).abs() < 1e-4, "{:?}", variance);
        }
    }

    #[test]
    fn test_invalid_momentum_is_rejected() {
        let kind: LayerKind = BatchNorm::new().with_momentum(1.0).into();
        assert!(matches!(kind.validate("bn"), Err(Error::Configuration(_))));
        let kind: LayerKind = BatchNorm::new().with_epsilon(0.0).into();
        assert!(kind.validate("bn").is_err());
    }

    #[test]
    fn test_rank_one_input_is_a_shape_error() {
        let shape = TensorShape::known(&[3]);
        assert!(matches!(
            BatchNorm::new().compute_output_shape("bn", &[shape]),
            Err(Error::Shape { .. })
        ));
    }
}
