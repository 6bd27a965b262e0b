//! 2-D convolution over NHWC images.

use super::basic::define_parameter;
use super::{single, Activation, ForwardBuilding, ShapeInferable, VariableOwning};
use crate::asg::Padding;
use crate::error::{Error, Result};
use crate::initializers::Initializer;
use crate::regularizers::Regularizer;
use crate::shape::TensorShape;
use crate::state::GraphState;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Checks that `input` is a rank-4 NHWC shape and returns its channel count.
pub(crate) fn expect_image(layer: &str, input: &TensorShape) -> Result<Option<usize>> {
    if input.rank() != 4 {
        return Err(Error::shape(
            layer,
            format!("expected an input of rank 4 (batch, height, width, channels), got {}", input),
        ));
    }
    Ok(input.dim(3))
}

/// Output height and width of a sliding window. Unknown input sizes stay unknown.
pub(crate) fn spatial_output(
    layer: &str,
    input: &TensorShape,
    window: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
) -> Result<(Option<usize>, Option<usize>)> {
    let along = |axis: usize, k: usize, s: usize| -> Result<Option<usize>> {
        match input.dim(axis) {
            None => Ok(None),
            Some(len) => padding.output_len(len, k, s).map(Some).ok_or_else(|| {
                Error::shape(
                    layer,
                    format!("window {} with stride {} does not fit input size {} on axis {}", k, s, len, axis),
                )
            }),
        }
    };
    Ok((along(1, window.0, strides.0)?, along(2, window.1, strides.1)?))
}

pub(crate) fn validate_window(layer: &str, what: &str, window: (usize, usize), strides: (usize, usize)) -> Result<()> {
    if window.0 == 0 || window.1 == 0 || strides.0 == 0 || strides.1 == 0 {
        return Err(Error::config(format!(
            "layer '{}': {} {:?} and strides {:?} must be positive",
            layer, what, window, strides
        )));
    }
    Ok(())
}

/// Convolution with a `[kh, kw, in_channels, filters]` kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2D {
    pub filters: usize,
    pub kernel_size: (usize, usize),
    pub strides: (usize, usize),
    pub padding: Padding,
    pub activation: Activation,
    pub kernel_initializer: Initializer,
    pub bias_initializer: Initializer,
    pub use_bias: bool,
    #[serde(default)]
    pub kernel_regularizer: Option<Regularizer>,
    #[serde(default)]
    pub bias_regularizer: Option<Regularizer>,
}

impl Default for Conv2D {
    fn default() -> Self {
        Self {
            filters: 32,
            kernel_size: (3, 3),
            strides: (1, 1),
            padding: Padding::Same,
            activation: Activation::Relu,
            kernel_initializer: Initializer::he_normal(),
            bias_initializer: Initializer::he_uniform(),
            use_bias: true,
            kernel_regularizer: None,
            bias_regularizer: None,
        }
    }
}

impl Conv2D {
    pub fn new(filters: usize, kernel_size: (usize, usize)) -> Self {
        Self { filters, kernel_size, ..Default::default() }
    }

    pub fn with_strides(mut self, strides: (usize, usize)) -> Self {
        self.strides = strides;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
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

    pub(crate) fn validate(&self, layer: &str) -> Result<()> {
        validate_window(layer, "kernel size", self.kernel_size, self.strides)?;
        self.kernel_initializer.validate()?;
        self.bias_initializer.validate()?;
        for regularizer in self.kernel_regularizer.iter().chain(self.bias_regularizer.iter()) {
            regularizer.validate()?;
        }
        Ok(())
    }

    /// `(fan_in, fan_out)`; fan-out is scaled down by the stride area.
    pub fn fans(&self, in_channels: usize) -> (usize, usize) {
        let (kh, kw) = self.kernel_size;
        let fan_in = in_channels * kh * kw;
        let stride_area = (self.strides.0 * self.strides.1).max(1) as f64;
        let fan_out = ((self.filters * kh * kw) as f64 / stride_area).round() as usize;
        (fan_in, fan_out)
    }

    fn in_channels(&self, layer: &str, input: &TensorShape) -> Result<usize> {
        expect_image(layer, input)?
            .ok_or_else(|| Error::shape(layer, format!("channel dimension of input {} is unknown", input)))
    }
}

impl ShapeInferable for Conv2D {
    fn compute_output_shape(&self, layer: &str, inputs: &[TensorShape]) -> Result<TensorShape> {
        let input = single(layer, inputs)?;
        self.in_channels(layer, input)?;
        let (h, w) = spatial_output(layer, input, self.kernel_size, self.strides, self.padding)?;
        Ok(TensorShape::new(vec![input.dim(0), h, w, Some(self.filters)]))
    }
}

impl VariableOwning for Conv2D {
    fn define_variables(
        &self,
        layer: &str,
        trainable: bool,
        input: &TensorShape,
        state: &mut GraphState,
    ) -> Result<Vec<Tensor>> {
        let in_channels = self.in_channels(layer, input)?;
        let fans = self.fans(in_channels);
        let (kh, kw) = self.kernel_size;
        let mut variables = vec![define_parameter(
            state,
            &format!("{}_conv2d_kernel", layer),
            &[kh, kw, in_channels, self.filters],
            trainable,
            &self.kernel_initializer,
            fans,
            self.kernel_regularizer,
        )?];
        if self.use_bias {
            variables.push(define_parameter(
                state,
                &format!("{}_conv2d_bias", layer),
                &[self.filters],
                trainable,
                &self.bias_initializer,
                fans,
                self.bias_regularizer,
            )?);
        }
        Ok(variables)
    }

    fn param_count(&self, input: &TensorShape) -> usize {
        let in_channels = input.dim(3).unwrap_or(0);
        let kernel = self.kernel_size.0 * self.kernel_size.1 * in_channels * self.filters;
        kernel + if self.use_bias { self.filters } else { 0 }
    }
}

impl ForwardBuilding for Conv2D {
    fn build_forward(&self, layer: &str, inputs: &[Tensor], variables: &[Tensor]) -> Result<Tensor> {
        let x = single(layer, inputs)?;
        let kernel = variables
            .first()
            .ok_or_else(|| Error::lifecycle(format!("layer '{}' has no kernel", layer)))?;
        let mut out = x.conv2d(kernel, self.strides, self.padding);
        if let Some(bias) = variables.get(1) {
            out = &out + bias;
        }
        Ok(self.activation.apply(&out))
    }
}
