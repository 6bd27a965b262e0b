//! Static shape inference over the ASG.
//!
//! Propagates [`TensorShape`]s from the leaves to every node, treating an
//! unknown dimension (the batch axis) as compatible with anything. Mismatches
//! that are already visible at build time are reported before any data flows.

use crate::asg::{Asg, AsgError, NodeId, NodeType, Padding};
use crate::shape::TensorShape;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': left operand {shape1}, right operand {shape2}.")]
    IncompatibleShapes {
        op: String,
        shape1: TensorShape,
        shape2: TensorShape,
    },

    #[error("Shape information missing for node {0}.")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for leaf '{0}'.")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected {expected}D, got {actual}D.")]
    InvalidRank {
        node_id: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("Node {node_id}: {message}")]
    InvalidAttribute { node_id: NodeId, message: String },

    #[error("Matrix multiplication error: incompatible inner dimensions {0} and {1}.")]
    MatmulDimensionError(usize, usize),
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

pub struct ShapeInference;

impl ShapeInference {
    /// Fills `shape` for every node that lacks one.
    ///
    /// Node ids are allocated after their operands, so ascending id order is a
    /// valid topological order for graphs built through [`crate::tensor::Tensor`].
    pub fn run(asg: &mut Asg) -> Result<()> {
        let mut ids: Vec<NodeId> = asg.nodes.keys().copied().collect();
        ids.sort_unstable();
        for node_id in ids {
            if asg.get_node(node_id)?.shape.is_some() {
                continue;
            }
            let shape = Self::infer_node_shape(asg, node_id)?;
            asg.get_node_mut(node_id)?.shape = Some(shape);
        }
        Ok(())
    }

    /// Shape of a single node whose operands already carry shapes.
    pub fn infer_node_shape(asg: &Asg, node_id: NodeId) -> Result<TensorShape> {
        let node = asg.get_node(node_id)?;
        let shape_of = |id: NodeId| -> Result<TensorShape> {
            asg.get_node(id)?
                .shape
                .clone()
                .ok_or(ShapeInferenceError::MissingShapeInfo(id))
        };

        match &node.node_type {
            NodeType::Input { name } | NodeType::Variable { name } => {
                Err(ShapeInferenceError::MissingInitialShape(name.clone()))
            }
            NodeType::Literal(value) => Ok(TensorShape::known(&value.shape())),

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r)
            | NodeType::Maximum(l, r)
            | NodeType::Minimum(l, r)
            | NodeType::GreaterEqual(l, r)
            | NodeType::Equal(l, r) => {
                let (ls, rs) = (shape_of(*l)?, shape_of(*r)?);
                broadcast_shapes(&ls, &rs).ok_or_else(|| ShapeInferenceError::IncompatibleShapes {
                    op: node.node_type.op_name().to_string(),
                    shape1: ls,
                    shape2: rs,
                })
            }

            NodeType::MatrixMultiply(l, r) => {
                let (ls, rs) = (shape_of(*l)?, shape_of(*r)?);
                if ls.rank() < 2 || rs.rank() != 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id,
                        expected: 2,
                        actual: ls.rank().min(rs.rank()),
                    });
                }
                if let (Some(k1), Some(k2)) = (ls.last(), rs.dim(0)) {
                    if k1 != k2 {
                        return Err(ShapeInferenceError::MatmulDimensionError(k1, k2));
                    }
                }
                let mut dims = ls.dims()[..ls.rank() - 1].to_vec();
                dims.push(rs.dim(1));
                Ok(TensorShape::new(dims))
            }

            NodeType::Negate(a)
            | NodeType::Exp(a)
            | NodeType::Log(a)
            | NodeType::Sqrt(a)
            | NodeType::Square(a)
            | NodeType::Abs(a)
            | NodeType::Sign(a)
            | NodeType::ReLU(a)
            | NodeType::Sigmoid(a)
            | NodeType::Tanh(a)
            | NodeType::Softmax(a)
            | NodeType::Softplus(a) => shape_of(*a),

            NodeType::Sum(_) | NodeType::Size { .. } | NodeType::TrainingFlag => Ok(TensorShape::scalar()),
            NodeType::SumLastAxis(a) | NodeType::Mean(a) | NodeType::ArgMax(a) => {
                let s = shape_of(*a)?;
                if s.rank() == 0 {
                    return Err(ShapeInferenceError::InvalidRank { node_id, expected: 1, actual: 0 });
                }
                Ok(s.replace_last(1))
            }

            NodeType::Reshape(a, target) => reshape_shape(node_id, &shape_of(*a)?, target),
            NodeType::ReshapeLike(_, like)
            | NodeType::Broadcast(_, like)
            | NodeType::ReduceSumTo(_, like) => shape_of(*like),
            NodeType::Transpose(a, ax1, ax2) => {
                let s = shape_of(*a)?;
                if *ax1 >= s.rank() || *ax2 >= s.rank() {
                    return Err(ShapeInferenceError::InvalidAttribute {
                        node_id,
                        message: format!("transpose axes ({}, {}) out of range for {}", ax1, ax2, s),
                    });
                }
                let mut dims = s.dims().to_vec();
                dims.swap(*ax1, *ax2);
                Ok(TensorShape::new(dims))
            }

            NodeType::Concat(inputs, axis) => {
                let shapes = inputs.iter().map(|id| shape_of(*id)).collect::<Result<Vec<_>>>()?;
                concat_shape(node_id, &shapes, *axis)
            }
            NodeType::ConcatGrad { inputs, index, .. } => {
                let id = inputs.get(*index).copied().ok_or(ShapeInferenceError::InvalidAttribute {
                    node_id,
                    message: format!("concat index {} out of range", index),
                })?;
                shape_of(id)
            }

            NodeType::Conv2d { input, kernel, strides, padding } => {
                let (is, ks) = (shape_of(*input)?, shape_of(*kernel)?);
                if is.rank() != 4 || ks.rank() != 4 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id,
                        expected: 4,
                        actual: is.rank().min(ks.rank()),
                    });
                }
                if let (Some(c), Some(kc)) = (is.dim(3), ks.dim(2)) {
                    if c != kc {
                        return Err(ShapeInferenceError::IncompatibleShapes {
                            op: "Conv2d".to_string(),
                            shape1: is,
                            shape2: ks,
                        });
                    }
                }
                let window = (ks.dim(0), ks.dim(1));
                windowed_shape(node_id, &is, window, *strides, *padding, ks.dim(3))
            }
            NodeType::MaxPool2d { input, pool, strides, padding }
            | NodeType::AvgPool2d { input, pool, strides, padding } => {
                let is = shape_of(*input)?;
                if is.rank() != 4 {
                    return Err(ShapeInferenceError::InvalidRank { node_id, expected: 4, actual: is.rank() });
                }
                let channels = is.dim(3);
                windowed_shape(node_id, &is, (Some(pool.0), Some(pool.1)), *strides, *padding, channels)
            }
            NodeType::Conv2dBackpropInput { input, .. }
            | NodeType::MaxPool2dGrad { input, .. }
            | NodeType::AvgPool2dGrad { input, .. } => shape_of(*input),
            NodeType::Conv2dBackpropKernel { kernel, .. } => shape_of(*kernel),

            NodeType::DropoutMask { like, rate, .. } => {
                if !(0.0..1.0).contains(rate) {
                    return Err(ShapeInferenceError::InvalidAttribute {
                        node_id,
                        message: format!("dropout rate {} outside [0, 1)", rate),
                    });
                }
                shape_of(*like)
            }
            NodeType::SoftmaxCrossEntropy { logits, labels } => {
                let (ls, ys) = (shape_of(*logits)?, shape_of(*labels)?);
                if broadcast_shapes(&ls, &ys).as_ref() != Some(&ls) {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "SoftmaxCrossEntropy".to_string(),
                        shape1: ls,
                        shape2: ys,
                    });
                }
                Ok(ls.replace_last(1))
            }
            NodeType::SoftmaxCrossEntropyGrad { logits, .. } => shape_of(*logits),
            NodeType::Assign { value, .. } => shape_of(*value),
        }
    }

    /// Every node reachable from `roots`, operands before their users.
    pub fn topological_sort_from(asg: &Asg, roots: &[NodeId]) -> Result<Vec<NodeId>> {
        let mut sorted = Vec::new();
        let mut visited = HashSet::new();
        for root in roots {
            Self::build_sorted_graph(*root, asg, &mut visited, &mut sorted)?;
        }
        Ok(sorted)
    }

    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        Self::topological_sort_from(asg, &asg.outputs)
    }

    fn build_sorted_graph(
        node_id: NodeId,
        asg: &Asg,
        visited: &mut HashSet<NodeId>,
        sorted: &mut Vec<NodeId>,
    ) -> Result<()> {
        if visited.contains(&node_id) {
            return Ok(());
        }
        let node = asg.get_node(node_id)?;
        for input_id in node.node_type.operands() {
            Self::build_sorted_graph(input_id, asg, visited, sorted)?;
        }
        if visited.insert(node_id) {
            sorted.push(node_id);
        }
        Ok(())
    }
}

/// Numpy broadcasting with unknown dimensions treated as wildcards.
pub fn broadcast_shapes(a: &TensorShape, b: &TensorShape) -> Option<TensorShape> {
    let rank = a.rank().max(b.rank());
    let mut dims = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = if i + a.rank() >= rank { Some(a.dims()[i + a.rank() - rank]) } else { None };
        let db = if i + b.rank() >= rank { Some(b.dims()[i + b.rank() - rank]) } else { None };
        let dim = match (da, db) {
            (None, Some(d)) | (Some(d), None) => d,
            (Some(x), Some(y)) => match (x, y) {
                (Some(1), other) | (other, Some(1)) => other,
                (Some(m), Some(n)) if m == n => Some(m),
                (Some(_), Some(_)) => return None,
                (None, known) | (known, None) => known,
            },
            (None, None) => None,
        };
        dims.push(dim);
    }
    Some(TensorShape::new(dims))
}

fn reshape_shape(node_id: NodeId, input: &TensorShape, target: &[isize]) -> Result<TensorShape> {
    let inferred = target.iter().filter(|&&d| d == -1).count();
    if inferred > 1 || target.iter().any(|&d| d == 0 || d < -1) {
        return Err(ShapeInferenceError::InvalidAttribute {
            node_id,
            message: format!("invalid reshape target {:?}", target),
        });
    }
    let known_product: usize = target.iter().filter(|&&d| d > 0).map(|&d| d as usize).product();
    let dims = target
        .iter()
        .map(|&d| {
            if d > 0 {
                Some(d as usize)
            } else {
                input.num_elements().map(|total| total / known_product.max(1))
            }
        })
        .collect();
    let out = TensorShape::new(dims);
    if let (Some(a), Some(b)) = (input.num_elements(), out.num_elements()) {
        if a != b {
            return Err(ShapeInferenceError::InvalidAttribute {
                node_id,
                message: format!("cannot reshape {} into {:?}", input, target),
            });
        }
    }
    Ok(out)
}

fn concat_shape(node_id: NodeId, shapes: &[TensorShape], axis: usize) -> Result<TensorShape> {
    let first = shapes.first().ok_or(ShapeInferenceError::InvalidAttribute {
        node_id,
        message: "concat of zero tensors".to_string(),
    })?;
    if axis >= first.rank() {
        return Err(ShapeInferenceError::InvalidAttribute {
            node_id,
            message: format!("concat axis {} out of range for {}", axis, first),
        });
    }
    let mut dims = first.dims().to_vec();
    for other in &shapes[1..] {
        if other.rank() != first.rank() {
            return Err(ShapeInferenceError::IncompatibleShapes {
                op: "Concat".to_string(),
                shape1: first.clone(),
                shape2: other.clone(),
            });
        }
        for (i, (d, o)) in dims.iter_mut().zip(other.dims()).enumerate() {
            if i == axis {
                *d = match (*d, *o) {
                    (Some(x), Some(y)) => Some(x + y),
                    _ => None,
                };
            } else if let (Some(x), Some(y)) = (*d, *o) {
                if x != y {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "Concat".to_string(),
                        shape1: first.clone(),
                        shape2: other.clone(),
                    });
                }
            }
        }
    }
    Ok(TensorShape::new(dims))
}

fn windowed_shape(
    node_id: NodeId,
    input: &TensorShape,
    window: (Option<usize>, Option<usize>),
    strides: (usize, usize),
    padding: Padding,
    channels: Option<usize>,
) -> Result<TensorShape> {
    let out_len = |len: Option<usize>, k: Option<usize>, s: usize| -> Result<Option<usize>> {
        match (len, k) {
            (Some(len), Some(k)) => padding.output_len(len, k, s).map(Some).ok_or_else(|| {
                ShapeInferenceError::InvalidAttribute {
                    node_id,
                    message: format!("window {} with stride {} does not fit length {}", k, s, len),
                }
            }),
            _ => Ok(None),
        }
    };
    let h = out_len(input.dim(1), window.0, strides.0)?;
    let w = out_len(input.dim(2), window.1, strides.1)?;
    Ok(TensorShape::new(vec![input.dims()[0], h, w, channels]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{GraphContext, Tensor};

    #[test]
    fn test_dense_chain_keeps_unknown_batch() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x", TensorShape::with_unknown_batch(&[4]));
        let w = Tensor::new_variable(&ctx, "w", &[4, 8]);
        let b = Tensor::new_variable(&ctx, "b", &[8]);
        let y = (&x.dot(&w) + &b).relu().sum_last_axis();

        let mut asg = ctx.borrow().main_graph().clone();
        ShapeInference::run(&mut asg).unwrap();
        let shape = asg.get_node(y.node_id).unwrap().shape.clone().unwrap();
        assert_eq!(shape, TensorShape::new(vec![None, Some(1)]));
    }

    #[test]
    fn test_matmul_mismatch_is_reported() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x", TensorShape::with_unknown_batch(&[4]));
        let w = Tensor::new_variable(&ctx, "w", &[5, 8]);
        let _ = x.dot(&w);

        let mut asg = ctx.borrow().main_graph().clone();
        assert_eq!(
            ShapeInference::run(&mut asg),
            Err(ShapeInferenceError::MatmulDimensionError(4, 5))
        );
    }

    #[test]
    fn test_conv_and_flatten_shapes() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x", TensorShape::with_unknown_batch(&[8, 8, 3]));
        let k = Tensor::new_variable(&ctx, "k", &[3, 3, 3, 16]);
        let conv = x.conv2d(&k, (1, 1), Padding::Same);
        let pooled = conv.max_pool2d((2, 2), (2, 2), Padding::Valid);
        let flat = pooled.reshape(vec![-1, 4 * 4 * 16]);

        let mut asg = ctx.borrow().main_graph().clone();
        ShapeInference::run(&mut asg).unwrap();
        let shape = |id| asg.get_node(id).unwrap().shape.clone().unwrap();
        assert_eq!(shape(conv.node_id), TensorShape::new(vec![None, Some(8), Some(8), Some(16)]));
        assert_eq!(shape(pooled.node_id), TensorShape::new(vec![None, Some(4), Some(4), Some(16)]));
        assert_eq!(shape(flat.node_id), TensorShape::new(vec![None, Some(256)]));
    }

    #[test]
    fn test_topological_sort_places_operands_first() {
        let ctx = GraphContext::shared();
        let a = Tensor::new_variable(&ctx, "a", &[2]);
        let b = Tensor::new_variable(&ctx, "b", &[2]);
        let c = &(&a * &b) + &a;

        let asg = ctx.borrow().main_graph().clone();
        let order = ShapeInference::topological_sort_from(&asg, &[c.node_id]).unwrap();
        assert_eq!(order.len(), 4);
        assert_eq!(order.last(), Some(&c.node_id));
        let pos = |id| order.iter().position(|&n| n == id).unwrap();
        assert!(pos(a.node_id) < pos(c.node_id));
        assert!(pos(b.node_id) < pos(c.node_id));
    }
}
