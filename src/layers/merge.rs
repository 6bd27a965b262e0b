//! Merge layers joining several inbound layers of a functional model.

use super::{ForwardBuilding, ShapeInferable};
use crate::error::{Error, Result};
use crate::shape::TensorShape;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

fn at_least_two<T>(layer: &str, inputs: &[T]) -> Result<()> {
    if inputs.len() < 2 {
        return Err(Error::shape(layer, format!("a merge layer needs at least 2 inputs, got {}", inputs.len())));
    }
    Ok(())
}

fn dims_agree(a: Option<usize>, b: Option<usize>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

/// Elementwise sum of inputs of identical shape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Add;

impl ShapeInferable for Add {
    fn compute_output_shape(&self, layer: &str, inputs: &[TensorShape]) -> Result<TensorShape> {
        at_least_two(layer, inputs)?;
        let first = &inputs[0];
        for other in &inputs[1..] {
            let same = other.rank() == first.rank()
                && first.dims().iter().zip(other.dims()).all(|(a, b)| dims_agree(*a, *b));
            if !same {
                return Err(Error::shape(layer, format!("cannot add shapes {} and {}", first, other)));
            }
        }
        Ok(first.clone())
    }
}

impl ForwardBuilding for Add {
    fn build_forward(&self, layer: &str, inputs: &[Tensor], _variables: &[Tensor]) -> Result<Tensor> {
        at_least_two(layer, inputs)?;
        let mut sum = inputs[0].clone();
        for x in &inputs[1..] {
            sum = &sum + x;
        }
        Ok(sum)
    }
}

/// Joins inputs along `axis`; negative values count from the last axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concatenate {
    pub axis: isize,
}

impl Default for Concatenate {
    fn default() -> Self {
        Self { axis: -1 }
    }
}

impl Concatenate {
    pub fn new(axis: isize) -> Self {
        Self { axis }
    }

    /// Resolves the axis for inputs of `rank`; the batch axis cannot be joined.
    fn resolve_axis(&self, layer: &str, rank: usize) -> Result<usize> {
        let axis = if self.axis < 0 { rank as isize + self.axis } else { self.axis };
        if axis < 1 || axis >= rank as isize {
            return Err(Error::shape(layer, format!("axis {} is invalid for inputs of rank {}", self.axis, rank)));
        }
        Ok(axis as usize)
    }
}

impl ShapeInferable for Concatenate {
    fn compute_output_shape(&self, layer: &str, inputs: &[TensorShape]) -> Result<TensorShape> {
        at_least_two(layer, inputs)?;
        let first = &inputs[0];
        let axis = self.resolve_axis(layer, first.rank())?;
        let mut joined = first.dim(axis);
        for other in &inputs[1..] {
            let compatible = other.rank() == first.rank()
                && (0..first.rank())
                    .filter(|&i| i != axis)
                    .all(|i| dims_agree(first.dims()[i], other.dims()[i]));
            if !compatible {
                return Err(Error::shape(
                    layer,
                    format!("cannot concatenate {} and {} along axis {}", first, other, axis),
                ));
            }
            joined = joined.zip(other.dim(axis)).map(|(a, b)| a + b);
        }
        let mut dims = first.dims().to_vec();
        dims[axis] = joined;
        Ok(TensorShape::new(dims))
    }
}

impl ForwardBuilding for Concatenate {
    fn build_forward(&self, layer: &str, inputs: &[Tensor], _variables: &[Tensor]) -> Result<Tensor> {
        at_least_two(layer, inputs)?;
        let rank = {
            let graph = inputs[0].context.borrow();
            graph
                .main_graph()
                .shape_of(inputs[0].node_id)?
                .map(TensorShape::rank)
                .ok_or_else(|| Error::shape(layer, "input shape is unknown at graph construction"))?
        };
        let axis = self.resolve_axis(layer, rank)?;
        Tensor::concat(inputs, axis).ok_or_else(|| Error::shape(layer, "nothing to concatenate"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batched(tail: &[usize]) -> TensorShape {
        TensorShape::with_unknown_batch(tail)
    }

    #[test]
    fn test_add_requires_matching_shapes() {
        assert_eq!(Add.compute_output_shape("a", &[batched(&[4]), batched(&[4])]).unwrap(), batched(&[4]));
        assert!(Add.compute_output_shape("a", &[batched(&[4]), batched(&[5])]).is_err());
        assert!(Add.compute_output_shape("a", &[batched(&[4])]).is_err());
    }

    #[test]
    fn test_concatenate_sums_the_joined_axis() {
        let concat = Concatenate::default();
        let out = concat
            .compute_output_shape("c", &[batched(&[2, 3]), batched(&[2, 5]), batched(&[2, 1])])
            .unwrap();
        assert_eq!(out, batched(&[2, 9]));

        assert!(concat.compute_output_shape("c", &[batched(&[2, 3]), batched(&[4, 3])]).is_err());
        assert!(Concatenate::new(0).compute_output_shape("c", &[batched(&[2]), batched(&[2])]).is_err());
    }
}
