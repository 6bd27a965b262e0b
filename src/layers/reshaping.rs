//! Batch-preserving reshapes.

use super::{single, ForwardBuilding, ShapeInferable};
use crate::error::{Error, Result};
use crate::shape::TensorShape;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

fn known_tail_elements(layer: &str, input: &TensorShape) -> Result<usize> {
    if input.rank() < 2 {
        return Err(Error::shape(layer, format!("expected a batched input, got {}", input)));
    }
    input
        .tail_elements()
        .ok_or_else(|| Error::shape(layer, format!("input {} has unknown non-batch dimensions", input)))
}

/// Collapses every non-batch axis into one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flatten;

impl ShapeInferable for Flatten {
    fn compute_output_shape(&self, layer: &str, inputs: &[TensorShape]) -> Result<TensorShape> {
        let input = single(layer, inputs)?;
        let n = known_tail_elements(layer, input)?;
        Ok(TensorShape::new(vec![input.dim(0), Some(n)]))
    }
}

impl ForwardBuilding for Flatten {
    fn build_forward(&self, layer: &str, inputs: &[Tensor], _variables: &[Tensor]) -> Result<Tensor> {
        let x = single(layer, inputs)?;
        let n = known_tail_elements(layer, &self.input_shape(layer, x)?)?;
        Ok(x.reshape(vec![-1, n as isize]))
    }
}

impl Flatten {
    fn input_shape(&self, layer: &str, x: &Tensor) -> Result<TensorShape> {
        let graph = x.context.borrow();
        graph
            .main_graph()
            .shape_of(x.node_id)?
            .cloned()
            .ok_or_else(|| Error::shape(layer, "input shape is unknown at graph construction"))
    }
}

/// Reshapes each example to `target_shape`; the element count must match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reshape {
    pub target_shape: Vec<usize>,
}

impl Reshape {
    pub fn new(target_shape: Vec<usize>) -> Self {
        Self { target_shape }
    }
}

impl ShapeInferable for Reshape {
    fn compute_output_shape(&self, layer: &str, inputs: &[TensorShape]) -> Result<TensorShape> {
        let input = single(layer, inputs)?;
        let n = known_tail_elements(layer, input)?;
        let target: usize = self.target_shape.iter().product();
        if target != n {
            return Err(Error::shape(
                layer,
                format!("cannot reshape {} into {:?}: {} != {} elements", input, self.target_shape, n, target),
            ));
        }
        let mut dims = vec![input.dim(0)];
        dims.extend(self.target_shape.iter().map(|&d| Some(d)));
        Ok(TensorShape::new(dims))
    }
}

impl ForwardBuilding for Reshape {
    fn build_forward(&self, layer: &str, inputs: &[Tensor], _variables: &[Tensor]) -> Result<Tensor> {
        let x = single(layer, inputs)?;
        let mut shape = vec![-1isize];
        shape.extend(self.target_shape.iter().map(|&d| d as isize));
        Ok(x.reshape(shape))
    }
}
