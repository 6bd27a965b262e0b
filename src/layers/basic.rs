//! Input, fully connected, activation and dropout layers.

use super::{single, Activation, ForwardBuilding, ShapeInferable, VariableOwning};
use crate::error::{Error, Result};
use crate::initializers::Initializer;
use crate::regularizers::Regularizer;
use crate::shape::TensorShape;
use crate::state::GraphState;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Model input with a fixed per-example shape; the batch axis is left unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    pub shape: Vec<usize>,
}

impl Input {
    pub fn new(shape: &[usize]) -> Self {
        Self { shape: shape.to_vec() }
    }

    pub fn tensor_shape(&self) -> TensorShape {
        TensorShape::with_unknown_batch(&self.shape)
    }
}

impl ShapeInferable for Input {
    fn compute_output_shape(&self, layer: &str, inputs: &[TensorShape]) -> Result<TensorShape> {
        if !inputs.is_empty() {
            return Err(Error::shape(layer, "an input layer has no inbound layers"));
        }
        Ok(self.tensor_shape())
    }
}

impl ForwardBuilding for Input {
    /// Passes the placeholder created by the network through.
    fn build_forward(&self, layer: &str, inputs: &[Tensor], _variables: &[Tensor]) -> Result<Tensor> {
        single(layer, inputs).cloned()
    }
}

/// Registers one parameter with its initializer and optional penalty.
pub(crate) fn define_parameter(
    state: &mut GraphState,
    name: &str,
    shape: &[usize],
    trainable: bool,
    initializer: &Initializer,
    fans: (usize, usize),
    regularizer: Option<Regularizer>,
) -> Result<Tensor> {
    let tensor = state.add_variable(name, shape, trainable)?;
    state.add_initializer(name, initializer.clone(), fans.0, fans.1)?;
    if let Some(regularizer) = regularizer {
        state.add_regularizer(name, regularizer)?;
    }
    Ok(tensor)
}

/// Fully connected layer, `activation(x . kernel + bias)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub units: usize,
    pub activation: Activation,
    pub kernel_initializer: Initializer,
    pub bias_initializer: Initializer,
    pub use_bias: bool,
    #[serde(default)]
    pub kernel_regularizer: Option<Regularizer>,
    #[serde(default)]
    pub bias_regularizer: Option<Regularizer>,
}

impl Default for Dense {
    fn default() -> Self {
        Self {
            units: 128,
            activation: Activation::Relu,
            kernel_initializer: Initializer::he_normal(),
            bias_initializer: Initializer::he_uniform(),
            use_bias: true,
            kernel_regularizer: None,
            bias_regularizer: None,
        }
    }
}

impl Dense {
    pub fn new(units: usize) -> Self {
        Self { units, ..Default::default() }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_kernel_initializer(mut self, initializer: Initializer) -> Self {
        self.kernel_initializer = initializer;
        self
    }

    pub fn with_bias_initializer(mut self, initializer: Initializer) -> Self {
        self.bias_initializer = initializer;
        self
    }

    pub fn without_bias(mut self) -> Self {
        self.use_bias = false;
        self
    }

    pub fn with_kernel_regularizer(mut self, regularizer: Regularizer) -> Self {
        self.kernel_regularizer = Some(regularizer);
        self
    }

    pub fn with_bias_regularizer(mut self, regularizer: Regularizer) -> Self {
        self.bias_regularizer = Some(regularizer);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.kernel_initializer.validate()?;
        self.bias_initializer.validate()?;
        for regularizer in self.kernel_regularizer.iter().chain(self.bias_regularizer.iter()) {
            regularizer.validate()?;
        }
        Ok(())
    }

    fn input_width(&self, layer: &str, input: &TensorShape) -> Result<usize> {
        if input.rank() < 2 {
            return Err(Error::shape(layer, format!("Dense expects an input of rank >= 2, got {}", input)));
        }
        input
            .last()
            .ok_or_else(|| Error::shape(layer, format!("last dimension of input {} is unknown", input)))
    }
}

impl ShapeInferable for Dense {
    fn compute_output_shape(&self, layer: &str, inputs: &[TensorShape]) -> Result<TensorShape> {
        let input = single(layer, inputs)?;
        self.input_width(layer, input)?;
        Ok(input.replace_last(self.units))
    }
}

impl VariableOwning for Dense {
    fn define_variables(
        &self,
        layer: &str,
        trainable: bool,
        input: &TensorShape,
        state: &mut GraphState,
    ) -> Result<Vec<Tensor>> {
        let fan_in = self.input_width(layer, input)?;
        let fans = (fan_in, self.units);
        let mut variables = vec![define_parameter(
            state,
            &format!("{}_dense_kernel", layer),
            &[fan_in, self.units],
            trainable,
            &self.kernel_initializer,
            fans,
            self.kernel_regularizer,
        )?];
        if self.use_bias {
            variables.push(define_parameter(
                state,
                &format!("{}_dense_bias", layer),
                &[self.units],
                trainable,
                &self.bias_initializer,
                fans,
                self.bias_regularizer,
            )?);
        }
        Ok(variables)
    }

    fn param_count(&self, input: &TensorShape) -> usize {
        let fan_in = input.last().unwrap_or(0);
        fan_in * self.units + if self.use_bias { self.units } else { 0 }
    }
}

impl ForwardBuilding for Dense {
    fn build_forward(&self, layer: &str, inputs: &[Tensor], variables: &[Tensor]) -> Result<Tensor> {
        let x = single(layer, inputs)?;
        let kernel = variables
            .first()
            .ok_or_else(|| Error::lifecycle(format!("layer '{}' has no kernel", layer)))?;
        let mut out = x.dot(kernel);
        if let Some(bias) = variables.get(1) {
            out = &out + bias;
        }
        Ok(self.activation.apply(&out))
    }
}

/// Applies an activation function to its input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActivationLayer {
    pub activation: Activation,
}

impl ActivationLayer {
    pub fn new(activation: Activation) -> Self {
        Self { activation }
    }
}

impl ShapeInferable for ActivationLayer {
    fn compute_output_shape(&self, layer: &str, inputs: &[TensorShape]) -> Result<TensorShape> {
        single(layer, inputs).cloned()
    }
}

impl ForwardBuilding for ActivationLayer {
    fn build_forward(&self, layer: &str, inputs: &[Tensor], _variables: &[Tensor]) -> Result<Tensor> {
        Ok(self.activation.apply(single(layer, inputs)?))
    }
}

/// Zeroes a `rate` fraction of activations while training and rescales the
/// rest by `1 / (1 - rate)`. Identity at inference.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dropout {
    pub rate: f32,
    pub seed: u64,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        Self { rate, seed: crate::initializers::DEFAULT_SEED }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.rate) {
            return Err(Error::config(format!("Dropout rate must be in [0, 1), got {}", self.rate)));
        }
        Ok(())
    }
}

impl ShapeInferable for Dropout {
    fn compute_output_shape(&self, layer: &str, inputs: &[TensorShape]) -> Result<TensorShape> {
        single(layer, inputs).cloned()
    }
}

impl ForwardBuilding for Dropout {
    fn build_forward(&self, layer: &str, inputs: &[Tensor], _variables: &[Tensor]) -> Result<Tensor> {
        let x = single(layer, inputs)?;
        if self.rate == 0.0 {
            return Ok(x.clone());
        }
        Ok(x.dropout(self.rate, self.seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Layer;

    #[test]
    fn test_dense_keeps_leading_dims() {
        let dense = Dense::new(5);
        let shape = TensorShape::new(vec![None, Some(7), Some(3)]);
        let out = dense.compute_output_shape("d", &[shape]).unwrap();
        assert_eq!(out, TensorShape::new(vec![None, Some(7), Some(5)]));

        assert!(matches!(
            dense.compute_output_shape("d", &[TensorShape::known(&[3])]),
            Err(Error::Shape { .. })
        ));
    }

    #[test]
    fn test_dense_without_bias_registers_kernel_only() {
        let mut state = GraphState::new();
        let mut layer = Layer::new(Dense::new(4).without_bias().with_kernel_regularizer(Regularizer::L2 { l2: 0.1 }))
            .named("proj");
        layer.build(&mut state, &[TensorShape::with_unknown_batch(&[6])]).unwrap();

        assert_eq!(layer.variable_names(), ["proj_dense_kernel"]);
        assert_eq!(layer.param_count(), 24);
        assert_eq!(state.regularizers().len(), 1);
    }

    #[test]
    fn test_dense_initializers_use_layer_fans() {
        let mut state = GraphState::new();
        let mut layer = Layer::new(Dense::new(3).with_bias_initializer(Initializer::Zeros)).named("d");
        layer.build(&mut state, &[TensorShape::with_unknown_batch(&[2])]).unwrap();
        state.run_initializers().unwrap();

        let expected = Initializer::he_normal().initialize(2, 3, &[2, 3]).unwrap();
        assert_eq!(state.value("d_dense_kernel").unwrap(), expected);
        assert!(state.value("d_dense_bias").unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_dropout_rate_is_validated() {
        assert!(Dropout::new(0.5).validate().is_ok());
        assert!(matches!(Dropout::new(1.0).validate(), Err(Error::Configuration(_))));
        assert!(matches!(Dropout::new(-0.1).validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_input_layer_rejects_inbound_shapes() {
        let input = Input::new(&[4]);
        assert_eq!(input.compute_output_shape("in", &[]).unwrap(), TensorShape::with_unknown_batch(&[4]));
        assert!(input.compute_output_shape("in", &[TensorShape::known(&[4])]).is_err());
    }
}
