//! Max and average pooling over NHWC images.

use super::conv::{expect_image, spatial_output, validate_window};
use super::{single, ShapeInferable};
use crate::asg::Padding;
use crate::error::Result;
use crate::shape::TensorShape;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Window configuration shared by `MaxPool2D` and `AvgPool2D`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool2D {
    pub pool_size: (usize, usize),
    pub strides: (usize, usize),
    pub padding: Padding,
}

impl Pool2D {
    /// Non-overlapping windows: strides equal the pool size.
    pub fn new(pool_size: (usize, usize)) -> Self {
        Self { pool_size, strides: pool_size, padding: Padding::Valid }
    }

    pub fn with_strides(mut self, strides: (usize, usize)) -> Self {
        self.strides = strides;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub(crate) fn validate(&self, layer: &str) -> Result<()> {
        validate_window(layer, "pool size", self.pool_size, self.strides)
    }

    pub(crate) fn build_max(&self, layer: &str, inputs: &[Tensor]) -> Result<Tensor> {
        Ok(single(layer, inputs)?.max_pool2d(self.pool_size, self.strides, self.padding))
    }

    pub(crate) fn build_avg(&self, layer: &str, inputs: &[Tensor]) -> Result<Tensor> {
        Ok(single(layer, inputs)?.avg_pool2d(self.pool_size, self.strides, self.padding))
    }
}

impl ShapeInferable for Pool2D {
    fn compute_output_shape(&self, layer: &str, inputs: &[TensorShape]) -> Result<TensorShape> {
        let input = single(layer, inputs)?;
        let channels = expect_image(layer, input)?;
        let (h, w) = spatial_output(layer, input, self.pool_size, self.strides, self.padding)?;
        Ok(TensorShape::new(vec![input.dim(0), h, w, channels]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Layer, LayerKind};
    use crate::state::GraphState;

    #[test]
    fn test_pool_halves_spatial_dims() {
        let pool = Pool2D::new((2, 2));
        let out = pool
            .compute_output_shape("p", &[TensorShape::with_unknown_batch(&[28, 28, 6])])
            .unwrap();
        assert_eq!(out, TensorShape::with_unknown_batch(&[14, 14, 6]));
    }

    #[test]
    fn test_same_padding_rounds_up() {
        let pool = Pool2D::new((2, 2)).with_padding(Padding::Same);
        let out = pool
            .compute_output_shape("p", &[TensorShape::with_unknown_batch(&[5, 7, 1])])
            .unwrap();
        assert_eq!(out, TensorShape::with_unknown_batch(&[3, 4, 1]));
    }

    #[test]
    fn test_pool_layer_owns_no_variables() {
        let mut state = GraphState::new();
        let mut layer = Layer::new(LayerKind::AvgPool2D(Pool2D::new((2, 2)))).named("avg");
        layer.build(&mut state, &[TensorShape::with_unknown_batch(&[4, 4, 2])]).unwrap();
        assert!(layer.variable_names().is_empty());
        assert_eq!(layer.param_count(), 0);
    }
}
