//! Reverse-mode differentiation over the ASG.
//!
//! The pass walks the forward graph in reverse topological order starting from
//! the loss, accumulates `dL/dnode` for every node on a path between the loss
//! and the requested variables, and appends the gradient nodes to the same
//! graph. The result is one gradient node per requested variable, in request
//! order, so callers can zip gradients with variables by index.
//!
//! Broadcasting is undone with `ReduceSumTo`; windowed ops and softmax
//! cross-entropy have dedicated backward nodes executed by the runtime.

use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, AsgError, NodeId, NodeType, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutogradError {
    #[error("ASG: {0}")]
    Asg(#[from] AsgError),
    #[error("Shape: {0}")]
    Shape(#[from] ShapeInferenceError),
    #[error("No gradient rule for operation '{0}'")]
    Unsupported(String),
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Builds gradient nodes into an existing graph.
pub struct Gradients<'a> {
    asg: &'a mut Asg,
    /// Forward node -> accumulated gradient node.
    gmap: HashMap<NodeId, NodeId>,
}

impl<'a> Gradients<'a> {
    pub fn new(asg: &'a mut Asg) -> Self {
        Self { asg, gmap: HashMap::new() }
    }

    /// Returns `d(loss)/d(wrt[i])` for every `i`. Variables that do not
    /// influence the loss receive a zeros-like gradient.
    pub fn build(mut self, loss: NodeId, wrt: &[NodeId]) -> AutogradResult<Vec<NodeId>> {
        ShapeInference::run(self.asg)?;

        let order = ShapeInference::topological_sort_from(self.asg, &[loss])?;
        let relevant = self.relevant_nodes(&order, wrt)?;

        let seed = self.add_node(NodeType::Literal(Value::ScalarF32(1.0)))?;
        self.gmap.insert(loss, seed);

        for &id in order.iter().rev() {
            if !relevant.contains(&id) {
                continue;
            }
            let g_out = match self.gmap.get(&id).copied() {
                Some(g) => g,
                None => continue,
            };
            let node_type = self.asg.get_node(id)?.node_type.clone();
            self.backprop(id, &node_type, g_out, &relevant)?;
        }

        wrt.iter()
            .map(|&v| match self.gmap.get(&v).copied() {
                Some(g) => Ok(g),
                None => {
                    let zero = self.add_node(NodeType::Literal(Value::ScalarF32(0.0)))?;
                    self.add_node(NodeType::Multiply(v, zero))
                }
            })
            .collect()
    }

    /// Nodes that both feed the loss and depend on at least one requested variable.
    fn relevant_nodes(&self, order: &[NodeId], wrt: &[NodeId]) -> AutogradResult<HashSet<NodeId>> {
        let mut relevant: HashSet<NodeId> = wrt.iter().copied().collect();
        for &id in order {
            let node = self.asg.get_node(id)?;
            if node.node_type.operands().iter().any(|op| relevant.contains(op)) {
                relevant.insert(id);
            }
        }
        Ok(relevant)
    }

    fn backprop(
        &mut self,
        id: NodeId,
        node_type: &NodeType,
        g: NodeId,
        relevant: &HashSet<NodeId>,
    ) -> AutogradResult<()> {
        let wants = |n: &NodeId| relevant.contains(n);
        match node_type {
            NodeType::Input { .. } | NodeType::Variable { .. } | NodeType::Literal(_) => {}

            NodeType::Add(a, b) => {
                if wants(a) {
                    let ra = self.reduce_to(g, *a)?;
                    self.acc(*a, ra)?;
                }
                if wants(b) {
                    let rb = self.reduce_to(g, *b)?;
                    self.acc(*b, rb)?;
                }
            }
            NodeType::Subtract(a, b) => {
                if wants(a) {
                    let ra = self.reduce_to(g, *a)?;
                    self.acc(*a, ra)?;
                }
                if wants(b) {
                    let neg = self.add_node(NodeType::Negate(g))?;
                    let rb = self.reduce_to(neg, *b)?;
                    self.acc(*b, rb)?;
                }
            }
            NodeType::Multiply(a, b) => {
                if wants(a) {
                    let ga = self.add_node(NodeType::Multiply(g, *b))?;
                    let ra = self.reduce_to(ga, *a)?;
                    self.acc(*a, ra)?;
                }
                if wants(b) {
                    let gb = self.add_node(NodeType::Multiply(g, *a))?;
                    let rb = self.reduce_to(gb, *b)?;
                    self.acc(*b, rb)?;
                }
            }
            NodeType::Divide(a, b) => {
                if wants(a) {
                    let ga = self.add_node(NodeType::Divide(g, *b))?;
                    let ra = self.reduce_to(ga, *a)?;
                    self.acc(*a, ra)?;
                }
                if wants(b) {
                    // d(a/b)/db = -y / b
                    let gy = self.add_node(NodeType::Multiply(g, id))?;
                    let q = self.add_node(NodeType::Divide(gy, *b))?;
                    let neg = self.add_node(NodeType::Negate(q))?;
                    let rb = self.reduce_to(neg, *b)?;
                    self.acc(*b, rb)?;
                }
            }
            NodeType::MatrixMultiply(a, b) => {
                if wants(a) {
                    let bt = self.add_node(NodeType::Transpose(*b, 0, 1))?;
                    let ga = self.add_node(NodeType::MatrixMultiply(g, bt))?;
                    self.acc(*a, ga)?;
                }
                if wants(b) {
                    let gb = self.matmul_rhs_grad(*a, *b, g)?;
                    self.acc(*b, gb)?;
                }
            }
            NodeType::Maximum(a, b) | NodeType::Minimum(a, b) => {
                let mask = if matches!(node_type, NodeType::Maximum(..)) {
                    self.add_node(NodeType::GreaterEqual(*a, *b))?
                } else {
                    self.add_node(NodeType::GreaterEqual(*b, *a))?
                };
                if wants(a) {
                    let ga = self.add_node(NodeType::Multiply(g, mask))?;
                    let ra = self.reduce_to(ga, *a)?;
                    self.acc(*a, ra)?;
                }
                if wants(b) {
                    let one = self.scalar(1.0)?;
                    let inv = self.add_node(NodeType::Subtract(one, mask))?;
                    let gb = self.add_node(NodeType::Multiply(g, inv))?;
                    let rb = self.reduce_to(gb, *b)?;
                    self.acc(*b, rb)?;
                }
            }
            NodeType::GreaterEqual(..) | NodeType::Equal(..) | NodeType::Sign(_) => {}

            NodeType::Negate(a) => {
                let ga = self.add_node(NodeType::Negate(g))?;
                self.acc(*a, ga)?;
            }
            NodeType::Exp(a) => {
                let ga = self.add_node(NodeType::Multiply(g, id))?;
                self.acc(*a, ga)?;
            }
            NodeType::Log(a) => {
                let ga = self.add_node(NodeType::Divide(g, *a))?;
                self.acc(*a, ga)?;
            }
            NodeType::Sqrt(a) => {
                let two = self.scalar(2.0)?;
                let denom = self.add_node(NodeType::Multiply(id, two))?;
                let ga = self.add_node(NodeType::Divide(g, denom))?;
                self.acc(*a, ga)?;
            }
            NodeType::Square(a) => {
                let two = self.scalar(2.0)?;
                let twice = self.add_node(NodeType::Multiply(*a, two))?;
                let ga = self.add_node(NodeType::Multiply(g, twice))?;
                self.acc(*a, ga)?;
            }
            NodeType::Abs(a) => {
                let sign = self.add_node(NodeType::Sign(*a))?;
                let ga = self.add_node(NodeType::Multiply(g, sign))?;
                self.acc(*a, ga)?;
            }
            NodeType::ReLU(a) => {
                // The output is non-negative, so its sign is the 0/1 mask.
                let mask = self.add_node(NodeType::Sign(id))?;
                let ga = self.add_node(NodeType::Multiply(g, mask))?;
                self.acc(*a, ga)?;
            }
            NodeType::Sigmoid(a) => {
                let one = self.scalar(1.0)?;
                let rest = self.add_node(NodeType::Subtract(one, id))?;
                let local = self.add_node(NodeType::Multiply(id, rest))?;
                let ga = self.add_node(NodeType::Multiply(g, local))?;
                self.acc(*a, ga)?;
            }
            NodeType::Tanh(a) => {
                let one = self.scalar(1.0)?;
                let sq = self.add_node(NodeType::Square(id))?;
                let local = self.add_node(NodeType::Subtract(one, sq))?;
                let ga = self.add_node(NodeType::Multiply(g, local))?;
                self.acc(*a, ga)?;
            }
            NodeType::Softmax(a) => {
                let gy = self.add_node(NodeType::Multiply(g, id))?;
                let dot = self.add_node(NodeType::SumLastAxis(gy))?;
                let centered = self.add_node(NodeType::Subtract(g, dot))?;
                let ga = self.add_node(NodeType::Multiply(id, centered))?;
                self.acc(*a, ga)?;
            }
            NodeType::Softplus(a) => {
                let s = self.add_node(NodeType::Sigmoid(*a))?;
                let ga = self.add_node(NodeType::Multiply(g, s))?;
                self.acc(*a, ga)?;
            }

            NodeType::Sum(a) | NodeType::SumLastAxis(a) => {
                let ga = self.add_node(NodeType::Broadcast(g, *a))?;
                self.acc(*a, ga)?;
            }
            NodeType::Mean(a) => {
                let spread = self.add_node(NodeType::Broadcast(g, *a))?;
                let n = self.add_node(NodeType::Size { input: *a, axis: Some(-1) })?;
                let ga = self.add_node(NodeType::Divide(spread, n))?;
                self.acc(*a, ga)?;
            }
            NodeType::ArgMax(_) | NodeType::Size { .. } | NodeType::DropoutMask { .. } | NodeType::TrainingFlag => {}

            NodeType::Reshape(a, _) | NodeType::ReshapeLike(a, _) => {
                let ga = self.add_node(NodeType::ReshapeLike(g, *a))?;
                self.acc(*a, ga)?;
            }
            NodeType::Transpose(a, ax1, ax2) => {
                let ga = self.add_node(NodeType::Transpose(g, *ax1, *ax2))?;
                self.acc(*a, ga)?;
            }
            NodeType::Broadcast(a, _) => {
                let ga = self.add_node(NodeType::ReduceSumTo(g, *a))?;
                self.acc(*a, ga)?;
            }
            NodeType::ReduceSumTo(a, _) => {
                let ga = self.add_node(NodeType::Broadcast(g, *a))?;
                self.acc(*a, ga)?;
            }
            NodeType::Concat(inputs, axis) => {
                for (index, input) in inputs.iter().enumerate() {
                    if wants(input) {
                        let gi = self.add_node(NodeType::ConcatGrad {
                            grad: g,
                            inputs: inputs.clone(),
                            axis: *axis,
                            index,
                        })?;
                        self.acc(*input, gi)?;
                    }
                }
            }

            NodeType::Conv2d { input, kernel, strides, padding } => {
                if wants(input) {
                    let gi = self.add_node(NodeType::Conv2dBackpropInput {
                        input: *input,
                        kernel: *kernel,
                        grad: g,
                        strides: *strides,
                        padding: *padding,
                    })?;
                    self.acc(*input, gi)?;
                }
                if wants(kernel) {
                    let gk = self.add_node(NodeType::Conv2dBackpropKernel {
                        input: *input,
                        kernel: *kernel,
                        grad: g,
                        strides: *strides,
                        padding: *padding,
                    })?;
                    self.acc(*kernel, gk)?;
                }
            }
            NodeType::MaxPool2d { input, pool, strides, padding } => {
                let gi = self.add_node(NodeType::MaxPool2dGrad {
                    input: *input,
                    grad: g,
                    pool: *pool,
                    strides: *strides,
                    padding: *padding,
                })?;
                self.acc(*input, gi)?;
            }
            NodeType::AvgPool2d { input, pool, strides, padding } => {
                let gi = self.add_node(NodeType::AvgPool2dGrad {
                    input: *input,
                    grad: g,
                    pool: *pool,
                    strides: *strides,
                    padding: *padding,
                })?;
                self.acc(*input, gi)?;
            }
            NodeType::SoftmaxCrossEntropy { logits, labels } => {
                if wants(labels) {
                    return Err(AutogradError::Unsupported(
                        "SoftmaxCrossEntropy with respect to labels".to_string(),
                    ));
                }
                let gl = self.add_node(NodeType::SoftmaxCrossEntropyGrad {
                    logits: *logits,
                    labels: *labels,
                    grad: g,
                })?;
                self.acc(*logits, gl)?;
            }
            NodeType::Assign { .. } => {}

            NodeType::ConcatGrad { .. }
            | NodeType::Conv2dBackpropInput { .. }
            | NodeType::Conv2dBackpropKernel { .. }
            | NodeType::MaxPool2dGrad { .. }
            | NodeType::AvgPool2dGrad { .. }
            | NodeType::SoftmaxCrossEntropyGrad { .. } => {
                return Err(AutogradError::Unsupported(node_type.op_name().to_string()));
            }
        }
        Ok(())
    }

    /// `aᵀ · g`, flattening leading axes of `a` when it has rank above 2.
    fn matmul_rhs_grad(&mut self, a: NodeId, b: NodeId, g: NodeId) -> AutogradResult<NodeId> {
        let a_rank = self.rank_of(a)?;
        if a_rank == 2 {
            let at = self.add_node(NodeType::Transpose(a, 0, 1))?;
            return self.add_node(NodeType::MatrixMultiply(at, g));
        }
        let b_shape = self
            .asg
            .get_node(b)?
            .shape
            .clone()
            .ok_or(ShapeInferenceError::MissingShapeInfo(b))?;
        let (k, n) = match (b_shape.dim(0), b_shape.dim(1)) {
            (Some(k), Some(n)) => (k as isize, n as isize),
            _ => return Err(ShapeInferenceError::MissingShapeInfo(b).into()),
        };
        let a2 = self.add_node(NodeType::Reshape(a, vec![-1, k]))?;
        let g2 = self.add_node(NodeType::Reshape(g, vec![-1, n]))?;
        let at = self.add_node(NodeType::Transpose(a2, 0, 1))?;
        self.add_node(NodeType::MatrixMultiply(at, g2))
    }

    fn rank_of(&self, id: NodeId) -> AutogradResult<usize> {
        self.asg
            .get_node(id)?
            .shape
            .as_ref()
            .map(|s| s.rank())
            .ok_or_else(|| ShapeInferenceError::MissingShapeInfo(id).into())
    }

    /// Sums `g` down to the shape of `target` unless the shapes already agree.
    fn reduce_to(&mut self, g: NodeId, target: NodeId) -> AutogradResult<NodeId> {
        let gs = self.asg.get_node(g)?.shape.clone();
        let ts = self.asg.get_node(target)?.shape.clone();
        if gs.is_some() && gs == ts {
            return Ok(g);
        }
        self.add_node(NodeType::ReduceSumTo(g, target))
    }

    fn acc(&mut self, target: NodeId, contribution: NodeId) -> AutogradResult<()> {
        let total = match self.gmap.get(&target).copied() {
            Some(prev) => self.add_node(NodeType::Add(prev, contribution))?,
            None => contribution,
        };
        self.gmap.insert(target, total);
        Ok(())
    }

    fn scalar(&mut self, value: f32) -> AutogradResult<NodeId> {
        self.add_node(NodeType::Literal(Value::ScalarF32(value)))
    }

    fn add_node(&mut self, node_type: NodeType) -> AutogradResult<NodeId> {
        let id = self.asg.add_node(None, node_type);
        let shape = ShapeInference::infer_node_shape(self.asg, id)?;
        self.asg.get_node_mut(id)?.shape = Some(shape);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::TensorShape;
    use crate::tensor::{GraphContext, Tensor};

    #[test]
    fn test_one_gradient_per_variable_in_order() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x", TensorShape::with_unknown_batch(&[3]));
        let w = Tensor::new_variable(&ctx, "w", &[3, 2]);
        let b = Tensor::new_variable(&ctx, "b", &[2]);
        let unused = Tensor::new_variable(&ctx, "unused", &[4]);
        let loss = (&x.dot(&w) + &b).square().sum();

        let mut asg = ctx.borrow().main_graph().clone();
        let grads = Gradients::new(&mut asg)
            .build(loss.node_id, &[b.node_id, unused.node_id, w.node_id])
            .unwrap();

        assert_eq!(grads.len(), 3);
        let shape = |id: NodeId| asg.get_node(id).unwrap().shape.clone().unwrap();
        assert_eq!(shape(grads[0]), TensorShape::known(&[2]));
        assert_eq!(shape(grads[1]), TensorShape::known(&[4]));
        assert_eq!(shape(grads[2]), TensorShape::known(&[3, 2]));
    }

    #[test]
    fn test_labels_are_not_differentiated() {
        let ctx = GraphContext::shared();
        let logits = Tensor::new_variable(&ctx, "logits", &[2, 3]);
        let labels = Tensor::new_input(&ctx, "y", TensorShape::with_unknown_batch(&[3]));
        let loss = logits.softmax_cross_entropy(&labels).sum();

        let mut asg = ctx.borrow().main_graph().clone();
        let grads = Gradients::new(&mut asg).build(loss.node_id, &[logits.node_id]).unwrap();
        assert!(matches!(
            asg.get_node(grads[0]).unwrap().node_type,
            NodeType::SoftmaxCrossEntropyGrad { .. }
        ));
    }
}
