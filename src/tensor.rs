//! `Tensor` and `GraphContext`.
//!
//! A `Tensor` holds no data. It is a lightweight handle naming a node of the
//! ASG owned by a shared `GraphContext`; every operation on it appends a node
//! and returns a handle to the result. Values only appear when a
//! [`Session`](crate::runtime::session::Session) runs the graph.

use crate::asg::{Asg, NodeId, NodeType, Padding, Value};
use crate::shape::TensorShape;
use ndarray::ArrayD;
use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;

/// Owns the graph under construction. Shared between handles via `Rc<RefCell<_>>`.
#[derive(Debug, Clone, Default)]
pub struct GraphContext {
    main_graph: Asg,
}

impl GraphContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn shared() -> Rc<RefCell<GraphContext>> {
        Rc::new(RefCell::new(Self::new()))
    }
}

/// Symbolic handle to one node of the graph.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub node_id: NodeId,
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    /// Placeholder fed with real data at run time.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str, shape: TensorShape) -> Self {
        let node_id = context.borrow_mut().main_graph_mut().add_node_with_shape(
            Some(name.to_string()),
            NodeType::Input { name: name.to_string() },
            shape,
        );
        Self { node_id, context: Rc::clone(context) }
    }

    /// Read of a named variable whose value lives in the session.
    pub fn new_variable(context: &Rc<RefCell<GraphContext>>, name: &str, shape: &[usize]) -> Self {
        let node_id = context.borrow_mut().main_graph_mut().add_node_with_shape(
            Some(name.to_string()),
            NodeType::Variable { name: name.to_string() },
            TensorShape::known(shape),
        );
        Self { node_id, context: Rc::clone(context) }
    }

    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(Some(name.to_string()), NodeType::Literal(Value::Tensor(data)));
        Self { node_id, context: Rc::clone(context) }
    }

    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32) -> Self {
        let node_id = context
            .borrow_mut()
            .main_graph_mut()
            .add_node(None, NodeType::Literal(Value::ScalarF32(value)));
        Self { node_id, context: Rc::clone(context) }
    }

    /// Scalar that reads `1` inside training runs and `0` elsewhere.
    pub fn training_flag(context: &Rc<RefCell<GraphContext>>) -> Self {
        let node_id = context.borrow_mut().main_graph_mut().add_node(None, NodeType::TrainingFlag);
        Self { node_id, context: Rc::clone(context) }
    }

    /// Wraps an existing node id in a handle.
    pub fn from_node(context: &Rc<RefCell<GraphContext>>, node_id: NodeId) -> Self {
        Self { node_id, context: Rc::clone(context) }
    }

    fn push(&self, node_type: NodeType) -> Self {
        let node_id = self.context.borrow_mut().main_graph_mut().add_node(None, node_type);
        Self { node_id, context: Rc::clone(&self.context) }
    }

    fn constant(&self, value: f32) -> Self {
        Self::scalar(&self.context, value)
    }

    // --- Elementwise ---

    pub fn maximum(&self, other: &Tensor) -> Self {
        self.push(NodeType::Maximum(self.node_id, other.node_id))
    }

    pub fn minimum(&self, other: &Tensor) -> Self {
        self.push(NodeType::Minimum(self.node_id, other.node_id))
    }

    pub fn maximum_scalar(&self, value: f32) -> Self {
        self.maximum(&self.constant(value))
    }

    pub fn minimum_scalar(&self, value: f32) -> Self {
        self.minimum(&self.constant(value))
    }

    /// Clamps every element into `[min, max]`.
    pub fn clip(&self, min: f32, max: f32) -> Self {
        self.maximum_scalar(min).minimum_scalar(max)
    }

    pub fn greater_equal(&self, other: &Tensor) -> Self {
        self.push(NodeType::GreaterEqual(self.node_id, other.node_id))
    }

    pub fn equal(&self, other: &Tensor) -> Self {
        self.push(NodeType::Equal(self.node_id, other.node_id))
    }

    pub fn add_scalar(&self, value: f32) -> Self {
        self + &self.constant(value)
    }

    pub fn mul_scalar(&self, value: f32) -> Self {
        self * &self.constant(value)
    }

    /// `value - self`.
    pub fn rsub_scalar(&self, value: f32) -> Self {
        &self.constant(value) - self
    }

    pub fn dot(&self, other: &Tensor) -> Self {
        self.push(NodeType::MatrixMultiply(self.node_id, other.node_id))
    }

    pub fn exp(&self) -> Self {
        self.push(NodeType::Exp(self.node_id))
    }

    pub fn log(&self) -> Self {
        self.push(NodeType::Log(self.node_id))
    }

    pub fn sqrt(&self) -> Self {
        self.push(NodeType::Sqrt(self.node_id))
    }

    pub fn square(&self) -> Self {
        self.push(NodeType::Square(self.node_id))
    }

    pub fn abs(&self) -> Self {
        self.push(NodeType::Abs(self.node_id))
    }

    pub fn sign(&self) -> Self {
        self.push(NodeType::Sign(self.node_id))
    }

    pub fn relu(&self) -> Self {
        self.push(NodeType::ReLU(self.node_id))
    }

    pub fn sigmoid(&self) -> Self {
        self.push(NodeType::Sigmoid(self.node_id))
    }

    pub fn tanh(&self) -> Self {
        self.push(NodeType::Tanh(self.node_id))
    }

    pub fn softmax(&self) -> Self {
        self.push(NodeType::Softmax(self.node_id))
    }

    pub fn softplus(&self) -> Self {
        self.push(NodeType::Softplus(self.node_id))
    }

    // --- Reductions ---

    pub fn sum(&self) -> Self {
        self.push(NodeType::Sum(self.node_id))
    }

    pub fn sum_last_axis(&self) -> Self {
        self.push(NodeType::SumLastAxis(self.node_id))
    }

    pub fn mean(&self) -> Self {
        self.push(NodeType::Mean(self.node_id))
    }

    /// Mean of every element as a scalar.
    pub fn mean_all(&self) -> Self {
        &self.sum() / &self.size()
    }

    pub fn argmax(&self) -> Self {
        self.push(NodeType::ArgMax(self.node_id))
    }

    /// Total element count as a scalar, resolved at run time.
    pub fn size(&self) -> Self {
        self.push(NodeType::Size { input: self.node_id, axis: None })
    }

    pub fn size_of_axis(&self, axis: isize) -> Self {
        self.push(NodeType::Size { input: self.node_id, axis: Some(axis) })
    }

    // --- Shape ---

    pub fn reshape(&self, shape: Vec<isize>) -> Self {
        self.push(NodeType::Reshape(self.node_id, shape))
    }

    pub fn transpose(&self, axis1: usize, axis2: usize) -> Self {
        self.push(NodeType::Transpose(self.node_id, axis1, axis2))
    }

    pub fn broadcast_like(&self, like: &Tensor) -> Self {
        self.push(NodeType::Broadcast(self.node_id, like.node_id))
    }

    /// Sums the axes `like` does not have (or has as `1`), leaving `like`'s shape.
    pub fn reduce_sum_to(&self, like: &Tensor) -> Self {
        self.push(NodeType::ReduceSumTo(self.node_id, like.node_id))
    }

    pub fn concat(tensors: &[Tensor], axis: usize) -> Option<Self> {
        let first = tensors.first()?;
        Some(first.push(NodeType::Concat(tensors.iter().map(|t| t.node_id).collect(), axis)))
    }

    // --- Windowed ---

    pub fn conv2d(&self, kernel: &Tensor, strides: (usize, usize), padding: Padding) -> Self {
        self.push(NodeType::Conv2d { input: self.node_id, kernel: kernel.node_id, strides, padding })
    }

    pub fn max_pool2d(&self, pool: (usize, usize), strides: (usize, usize), padding: Padding) -> Self {
        self.push(NodeType::MaxPool2d { input: self.node_id, pool, strides, padding })
    }

    pub fn avg_pool2d(&self, pool: (usize, usize), strides: (usize, usize), padding: Padding) -> Self {
        self.push(NodeType::AvgPool2d { input: self.node_id, pool, strides, padding })
    }

    pub fn dropout(&self, rate: f32, seed: u64) -> Self {
        let mask = self.push(NodeType::DropoutMask { like: self.node_id, rate, seed });
        self * &mask
    }

    pub fn softmax_cross_entropy(&self, labels: &Tensor) -> Self {
        self.push(NodeType::SoftmaxCrossEntropy { logits: self.node_id, labels: labels.node_id })
    }

    /// Target op writing this tensor into the named variable.
    pub fn assign_to(&self, variable: &str) -> Self {
        self.push(NodeType::Assign { variable: variable.to_string(), value: self.node_id })
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $variant:ident) => {
        impl<'a> $trait<&'a Tensor> for &'a Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &'a Tensor) -> Self::Output {
                self.push(NodeType::$variant(self.node_id, rhs.node_id))
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Sub, sub, Subtract);
impl_binary_op!(Mul, mul, Multiply);
impl_binary_op!(Div, div, Divide);

impl Neg for &Tensor {
    type Output = Tensor;
    fn neg(self) -> Self::Output {
        self.push(NodeType::Negate(self.node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ops_append_nodes() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x", TensorShape::with_unknown_batch(&[3]));
        let w = Tensor::new_variable(&ctx, "w", &[3, 2]);
        let y = (&x.dot(&w) + &w.sum()).relu();

        let graph = ctx.borrow();
        let asg = graph.main_graph();
        assert_eq!(asg.inputs, vec![x.node_id]);
        assert!(matches!(asg.get_node(y.node_id).map(|n| &n.node_type), Ok(NodeType::ReLU(_))));
        assert_eq!(asg.len(), 6);
    }
}
