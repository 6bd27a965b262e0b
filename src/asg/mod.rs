//! ASG: the abstract semantic graph every model is lowered to.
//!
//! Nodes live in an arena keyed by [`NodeId`]; edges are the ids stored inside
//! [`NodeType`]. Nodes are only ever appended, so an id never changes meaning
//! and the gradient pass can extend the forward graph in place.

use crate::shape::TensorShape;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Node identifier.
pub type NodeId = usize;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("Node with ID {0} not found")]
    NodeNotFound(NodeId),
    #[error("Variable '{0}' has no node in the graph")]
    VariableNotFound(String),
    #[error("Operation is not supported: {0}")]
    UnsupportedOperation(String),
}

/// Padding policy for windowed ops, with Keras output-size formulas.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

impl Padding {
    /// Output length of a window of size `kernel` sliding with `stride` over `input`.
    /// Returns `None` when a `Valid` window does not fit.
    pub fn output_len(&self, input: usize, kernel: usize, stride: usize) -> Option<usize> {
        if stride == 0 || kernel == 0 {
            return None;
        }
        match self {
            Padding::Valid => {
                if input < kernel {
                    None
                } else {
                    Some((input - kernel) / stride + 1)
                }
            }
            Padding::Same => Some(input.div_ceil(stride)),
        }
    }

    /// Zeros added before the first element along one axis.
    pub fn pad_before(&self, input: usize, kernel: usize, stride: usize) -> usize {
        match self {
            Padding::Valid => 0,
            Padding::Same => {
                let out = input.div_ceil(stride.max(1));
                let needed = (out.saturating_sub(1) * stride + kernel).saturating_sub(input);
                needed / 2
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    /// Static shape, filled at creation for leaves and by shape inference for the rest.
    pub shape: Option<TensorShape>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Leaves
    Input { name: String },
    Variable { name: String },
    Literal(Value),

    // Binary, numpy broadcasting
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    MatrixMultiply(NodeId, NodeId),
    Maximum(NodeId, NodeId),
    Minimum(NodeId, NodeId),
    /// 1.0 where `a >= b`, else 0.0.
    GreaterEqual(NodeId, NodeId),
    /// 1.0 where `a == b`, else 0.0.
    Equal(NodeId, NodeId),

    // Unary
    Negate(NodeId),
    Exp(NodeId),
    Log(NodeId),
    Sqrt(NodeId),
    Square(NodeId),
    Abs(NodeId),
    Sign(NodeId),
    ReLU(NodeId),
    Sigmoid(NodeId),
    Tanh(NodeId),
    /// Over the last axis.
    Softmax(NodeId),
    Softplus(NodeId),

    // Reductions
    /// All elements to a scalar.
    Sum(NodeId),
    /// Last axis, keepdim.
    SumLastAxis(NodeId),
    /// Last axis, keepdim.
    Mean(NodeId),
    /// Index of the maximum along the last axis, keepdim, as f32.
    ArgMax(NodeId),
    /// Scalar element count, of the whole tensor or of one axis.
    Size { input: NodeId, axis: Option<isize> },

    // Shape manipulation
    /// Target shape; at most one `-1` entry is inferred.
    Reshape(NodeId, Vec<isize>),
    ReshapeLike(NodeId, NodeId),
    Transpose(NodeId, usize, usize),
    Broadcast(NodeId, NodeId),
    ReduceSumTo(NodeId, NodeId),
    Concat(Vec<NodeId>, usize),
    /// Slice of `grad` that belongs to `inputs[index]` of a `Concat`.
    ConcatGrad { grad: NodeId, inputs: Vec<NodeId>, axis: usize, index: usize },

    // Windowed ops over NHWC tensors; kernels are `[kh, kw, cin, cout]`.
    Conv2d { input: NodeId, kernel: NodeId, strides: (usize, usize), padding: Padding },
    Conv2dBackpropInput { input: NodeId, kernel: NodeId, grad: NodeId, strides: (usize, usize), padding: Padding },
    Conv2dBackpropKernel { input: NodeId, kernel: NodeId, grad: NodeId, strides: (usize, usize), padding: Padding },
    MaxPool2d { input: NodeId, pool: (usize, usize), strides: (usize, usize), padding: Padding },
    MaxPool2dGrad { input: NodeId, grad: NodeId, pool: (usize, usize), strides: (usize, usize), padding: Padding },
    AvgPool2d { input: NodeId, pool: (usize, usize), strides: (usize, usize), padding: Padding },
    AvgPool2dGrad { input: NodeId, grad: NodeId, pool: (usize, usize), strides: (usize, usize), padding: Padding },

    /// Inverted-dropout mask shaped like `like`: ones outside training,
    /// otherwise `0` or `1 / (1 - rate)` per element.
    DropoutMask { like: NodeId, rate: f32, seed: u64 },
    /// Scalar `1` during training runs, `0` otherwise.
    TrainingFlag,

    /// Per-example cross-entropy of `softmax(logits)` against `labels`, shape `[.., 1]`.
    SoftmaxCrossEntropy { logits: NodeId, labels: NodeId },
    SoftmaxCrossEntropyGrad { logits: NodeId, labels: NodeId, grad: NodeId },

    /// Writes `value` into the named variable when the run succeeds.
    Assign { variable: String, value: NodeId },
}

impl NodeType {
    /// Ids this node reads, in argument order.
    pub fn operands(&self) -> Vec<NodeId> {
        use NodeType::*;
        match self {
            Input { .. } | Variable { .. } | Literal(_) | TrainingFlag => vec![],
            Add(a, b) | Subtract(a, b) | Multiply(a, b) | Divide(a, b) | MatrixMultiply(a, b)
            | Maximum(a, b) | Minimum(a, b) | GreaterEqual(a, b) | Equal(a, b)
            | ReshapeLike(a, b) | Broadcast(a, b) | ReduceSumTo(a, b) => vec![*a, *b],
            Negate(a) | Exp(a) | Log(a) | Sqrt(a) | Square(a) | Abs(a) | Sign(a) | ReLU(a)
            | Sigmoid(a) | Tanh(a) | Softmax(a) | Softplus(a) | Sum(a) | SumLastAxis(a)
            | Mean(a) | ArgMax(a) | Reshape(a, _) | Transpose(a, _, _) => vec![*a],
            Size { input, .. } => vec![*input],
            Concat(inputs, _) => inputs.clone(),
            ConcatGrad { grad, inputs, .. } => {
                let mut ids = vec![*grad];
                ids.extend(inputs.iter().copied());
                ids
            }
            Conv2d { input, kernel, .. } => vec![*input, *kernel],
            Conv2dBackpropInput { input, kernel, grad, .. }
            | Conv2dBackpropKernel { input, kernel, grad, .. } => vec![*input, *kernel, *grad],
            MaxPool2d { input, .. } | AvgPool2d { input, .. } => vec![*input],
            MaxPool2dGrad { input, grad, .. } | AvgPool2dGrad { input, grad, .. } => vec![*input, *grad],
            DropoutMask { like, .. } => vec![*like],
            SoftmaxCrossEntropy { logits, labels } => vec![*logits, *labels],
            SoftmaxCrossEntropyGrad { logits, labels, grad } => vec![*logits, *labels, *grad],
            Assign { value, .. } => vec![*value],
        }
    }

    /// Short operator name used in error messages and logs.
    pub fn op_name(&self) -> &'static str {
        use NodeType::*;
        match self {
            Input { .. } => "Input",
            Variable { .. } => "Variable",
            Literal(_) => "Literal",
            Add(..) => "Add",
            Subtract(..) => "Subtract",
            Multiply(..) => "Multiply",
            Divide(..) => "Divide",
            MatrixMultiply(..) => "MatrixMultiply",
            Maximum(..) => "Maximum",
            Minimum(..) => "Minimum",
            GreaterEqual(..) => "GreaterEqual",
            Equal(..) => "Equal",
            Negate(_) => "Negate",
            Exp(_) => "Exp",
            Log(_) => "Log",
            Sqrt(_) => "Sqrt",
            Square(_) => "Square",
            Abs(_) => "Abs",
            Sign(_) => "Sign",
            ReLU(_) => "ReLU",
            Sigmoid(_) => "Sigmoid",
            Tanh(_) => "Tanh",
            Softmax(_) => "Softmax",
            Softplus(_) => "Softplus",
            Sum(_) => "Sum",
            SumLastAxis(_) => "SumLastAxis",
            Mean(_) => "Mean",
            ArgMax(_) => "ArgMax",
            Size { .. } => "Size",
            Reshape(..) => "Reshape",
            ReshapeLike(..) => "ReshapeLike",
            Transpose(..) => "Transpose",
            Broadcast(..) => "Broadcast",
            ReduceSumTo(..) => "ReduceSumTo",
            Concat(..) => "Concat",
            ConcatGrad { .. } => "ConcatGrad",
            Conv2d { .. } => "Conv2d",
            Conv2dBackpropInput { .. } => "Conv2dBackpropInput",
            Conv2dBackpropKernel { .. } => "Conv2dBackpropKernel",
            MaxPool2d { .. } => "MaxPool2d",
            MaxPool2dGrad { .. } => "MaxPool2dGrad",
            AvgPool2d { .. } => "AvgPool2d",
            AvgPool2dGrad { .. } => "AvgPool2dGrad",
            DropoutMask { .. } => "DropoutMask",
            TrainingFlag => "TrainingFlag",
            SoftmaxCrossEntropy { .. } => "SoftmaxCrossEntropy",
            SoftmaxCrossEntropyGrad { .. } => "SoftmaxCrossEntropyGrad",
            Assign { .. } => "Assign",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
}

impl Value {
    pub fn into_array(self) -> ArrayD<f32> {
        match self {
            Value::Tensor(arr) => arr,
            Value::ScalarF32(v) => ndarray::arr0(v).into_dyn(),
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            Value::Tensor(arr) => arr.shape().to_vec(),
            Value::ScalarF32(_) => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Asg {
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
    variables: HashMap<String, NodeId>,
}

impl Asg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        // Leaves whose shape is known from their payload get it right away.
        let shape = match &node_type {
            NodeType::Literal(value) => Some(TensorShape::known(&value.shape())),
            _ => None,
        };
        if let NodeType::Variable { name } = &node_type {
            self.variables.insert(name.clone(), new_id);
        }
        if let NodeType::Input { .. } = &node_type {
            self.inputs.push(new_id);
        }
        self.nodes.insert(new_id, Node { id: new_id, name, node_type, shape });
        new_id
    }

    pub fn add_node_with_shape(
        &mut self,
        name: Option<String>,
        node_type: NodeType,
        shape: TensorShape,
    ) -> NodeId {
        let id = self.add_node(name, node_type);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.shape = Some(shape);
        }
        id
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }

    /// Node that reads the named variable.
    pub fn variable_node(&self, name: &str) -> AsgResult<NodeId> {
        self.variables
            .get(name)
            .copied()
            .ok_or_else(|| AsgError::VariableNotFound(name.to_string()))
    }

    pub fn shape_of(&self, id: NodeId) -> AsgResult<Option<&TensorShape>> {
        Ok(self.get_node(id)?.shape.as_ref())
    }
}
