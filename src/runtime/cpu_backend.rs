//! CPU backend for executing an ASG.
//!
//! Walks the nodes needed for the requested roots in topological order and
//! computes each one with `ndarray`. Binary ops follow numpy broadcasting;
//! shape mismatches surface as `RuntimeError::ShapeError` instead of panics.

use super::backend::{Backend, Environment, RuntimeError};
use crate::analysis::shape_inference::ShapeInference;
use crate::asg::{Asg, AsgError, NodeId, NodeType, Padding, Value};
use ndarray::{concatenate, Array3, Array4, ArrayD, ArrayView4, ArrayViewD, Axis, Ix2, Ix4, IxDyn, Slice, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for CpuBackend {
    type DeviceData = ArrayD<f32>;

    fn load_data(&self, data: Vec<Value>) -> Result<Vec<ArrayD<f32>>> {
        Ok(data.into_iter().map(Value::into_array).collect())
    }

    fn run(&self, asg: &Asg, roots: &[NodeId], env: &Environment<'_, ArrayD<f32>>) -> Result<Vec<ArrayD<f32>>> {
        let order = ShapeInference::topological_sort_from(asg, roots)
            .map_err(|e| RuntimeError::ComputationError(e.to_string()))?;

        let mut values: HashMap<NodeId, ArrayD<f32>> = HashMap::with_capacity(order.len());
        for id in order {
            let value = match env.feeds.get(&id) {
                Some(fed) => fed.clone(),
                None => evaluate_node(asg, id, &values, env)?,
            };
            values.insert(id, value);
        }

        roots
            .iter()
            .map(|id| values.get(id).cloned().ok_or(RuntimeError::Graph(AsgError::NodeNotFound(*id))))
            .collect()
    }

    fn retrieve_data(&self, device_data: &[ArrayD<f32>]) -> Result<Vec<Value>> {
        Ok(device_data.iter().cloned().map(Value::Tensor).collect())
    }
}

fn evaluate_node(
    asg: &Asg,
    id: NodeId,
    values: &HashMap<NodeId, ArrayD<f32>>,
    env: &Environment<'_, ArrayD<f32>>,
) -> Result<ArrayD<f32>> {
    let node = asg.get_node(id)?;
    let v = |n: &NodeId| -> Result<&ArrayD<f32>> {
        values.get(n).ok_or(RuntimeError::Graph(AsgError::NodeNotFound(*n)))
    };

    match &node.node_type {
        NodeType::Input { name } => Err(RuntimeError::MissingInput(name.clone(), id)),
        NodeType::Variable { name } => env
            .variables
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::MissingParameter(name.clone(), id)),
        NodeType::Literal(value) => Ok(value.clone().into_array()),

        NodeType::Add(a, b) => broadcast_binary("Add", v(a)?, v(b)?, |x, y| x + y),
        NodeType::Subtract(a, b) => broadcast_binary("Subtract", v(a)?, v(b)?, |x, y| x - y),
        NodeType::Multiply(a, b) => broadcast_binary("Multiply", v(a)?, v(b)?, |x, y| x * y),
        NodeType::Divide(a, b) => broadcast_binary("Divide", v(a)?, v(b)?, |x, y| x / y),
        NodeType::Maximum(a, b) => broadcast_binary("Maximum", v(a)?, v(b)?, f32::max),
        NodeType::Minimum(a, b) => broadcast_binary("Minimum", v(a)?, v(b)?, f32::min),
        NodeType::GreaterEqual(a, b) => {
            broadcast_binary("GreaterEqual", v(a)?, v(b)?, |x, y| if x >= y { 1.0 } else { 0.0 })
        }
        NodeType::Equal(a, b) => {
            broadcast_binary("Equal", v(a)?, v(b)?, |x, y| if x == y { 1.0 } else { 0.0 })
        }
        NodeType::MatrixMultiply(a, b) => op_matmul(v(a)?, v(b)?),

        NodeType::Negate(a) => Ok(v(a)?.mapv(|x| -x)),
        NodeType::Exp(a) => Ok(v(a)?.mapv(f32::exp)),
        NodeType::Log(a) => Ok(v(a)?.mapv(f32::ln)),
        NodeType::Sqrt(a) => Ok(v(a)?.mapv(f32::sqrt)),
        NodeType::Square(a) => Ok(v(a)?.mapv(|x| x * x)),
        NodeType::Abs(a) => Ok(v(a)?.mapv(f32::abs)),
        NodeType::Sign(a) => Ok(v(a)?.mapv(sign)),
        NodeType::ReLU(a) => Ok(v(a)?.mapv(|x| x.max(0.0))),
        NodeType::Sigmoid(a) => Ok(v(a)?.mapv(|x| 1.0 / (1.0 + (-x).exp()))),
        NodeType::Tanh(a) => Ok(v(a)?.mapv(f32::tanh)),
        NodeType::Softmax(a) => op_softmax(v(a)?),
        NodeType::Softplus(a) => Ok(v(a)?.mapv(|x| x.max(0.0) + (-x.abs()).exp().ln_1p())),

        NodeType::Sum(a) => Ok(ndarray::arr0(v(a)?.sum()).into_dyn()),
        NodeType::SumLastAxis(a) => {
            let a = v(a)?;
            let axis = last_axis(a, "SumLastAxis")?;
            Ok(a.sum_axis(axis).insert_axis(axis))
        }
        NodeType::Mean(a) => {
            let a = v(a)?;
            let axis = last_axis(a, "Mean")?;
            let mean = a
                .mean_axis(axis)
                .ok_or_else(|| RuntimeError::ShapeError("Mean over an empty axis".to_string()))?;
            Ok(mean.insert_axis(axis))
        }
        NodeType::ArgMax(a) => op_argmax(v(a)?),
        NodeType::Size { input, axis } => op_size(v(input)?, *axis),

        NodeType::Reshape(a, target) => op_reshape(v(a)?, target),
        NodeType::ReshapeLike(a, like) => reshape_to(v(a)?, v(like)?.shape()),
        NodeType::Transpose(a, ax1, ax2) => op_transpose(v(a)?, *ax1, *ax2),
        NodeType::Broadcast(a, like) => op_broadcast(v(a)?, v(like)?.shape()),
        NodeType::ReduceSumTo(a, like) => op_reduce_sum_to(v(a)?, v(like)?.shape()),
        NodeType::Concat(inputs, axis) => {
            let views = inputs.iter().map(|n| v(n).map(|arr| arr.view())).collect::<Result<Vec<_>>>()?;
            op_concat(&views, *axis)
        }
        NodeType::ConcatGrad { grad, inputs, axis, index } => {
            let shapes = inputs.iter().map(|n| v(n).map(|arr| arr.shape().to_vec())).collect::<Result<Vec<_>>>()?;
            op_concat_grad(v(grad)?, &shapes, *axis, *index)
        }

        NodeType::Conv2d { input, kernel, strides, padding } => {
            op_conv2d(v(input)?, v(kernel)?, *strides, *padding)
        }
        NodeType::Conv2dBackpropInput { input, kernel, grad, strides, padding } => {
            op_conv2d_backprop_input(v(input)?, v(kernel)?, v(grad)?, *strides, *padding)
        }
        NodeType::Conv2dBackpropKernel { input, kernel, grad, strides, padding } => {
            op_conv2d_backprop_kernel(v(input)?, v(kernel)?, v(grad)?, *strides, *padding)
        }
        NodeType::MaxPool2d { input, pool, strides, padding } => {
            op_max_pool2d(v(input)?, *pool, *strides, *padding)
        }
        NodeType::MaxPool2dGrad { input, grad, pool, strides, padding } => {
            op_max_pool2d_grad(v(input)?, v(grad)?, *pool, *strides, *padding)
        }
        NodeType::AvgPool2d { input, pool, strides, padding } => {
            op_avg_pool2d(v(input)?, *pool, *strides, *padding)
        }
        NodeType::AvgPool2dGrad { input, grad, pool, strides, padding } => {
            op_avg_pool2d_grad(v(input)?, v(grad)?, *pool, *strides, *padding)
        }

        NodeType::DropoutMask { like, rate, seed } => Ok(op_dropout_mask(v(like)?.shape(), *rate, *seed, env)),
        NodeType::TrainingFlag => Ok(ndarray::arr0(if env.training { 1.0 } else { 0.0 }).into_dyn()),
        NodeType::SoftmaxCrossEntropy { logits, labels } => op_softmax_cross_entropy(v(logits)?, v(labels)?),
        NodeType::SoftmaxCrossEntropyGrad { logits, labels, grad } => {
            op_softmax_cross_entropy_grad(v(logits)?, v(labels)?, v(grad)?)
        }
        NodeType::Assign { value, .. } => Ok(v(value)?.clone()),
    }
}

fn sign(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn shape_error(op: &str, e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::ShapeError(format!("{}: {}", op, e))
}

/// Numpy broadcast of two concrete shapes.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    (0..rank)
        .map(|i| {
            let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
            let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
            if da == db || db == 1 {
                Some(da)
            } else if da == 1 {
                Some(db)
            } else {
                None
            }
        })
        .collect()
}

fn broadcast_binary(
    op: &str,
    a: &ArrayD<f32>,
    b: &ArrayD<f32>,
    f: impl Fn(f32, f32) -> f32,
) -> Result<ArrayD<f32>> {
    let mismatch = || shape_error(op, format!("cannot broadcast {:?} and {:?}", a.shape(), b.shape()));
    let shape = broadcast_shape(a.shape(), b.shape()).ok_or_else(mismatch)?;
    let av = a.broadcast(shape.as_slice()).ok_or_else(mismatch)?;
    let bv = b.broadcast(shape.as_slice()).ok_or_else(mismatch)?;
    Ok(Zip::from(av).and(bv).map_collect(|&x, &y| f(x, y)))
}

fn last_axis(a: &ArrayD<f32>, op: &str) -> Result<Axis> {
    if a.ndim() == 0 {
        Err(shape_error(op, "requires rank >= 1"))
    } else {
        Ok(Axis(a.ndim() - 1))
    }
}

fn op_matmul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    if a.ndim() == 0 || b.ndim() == 0 {
        return broadcast_binary("MatrixMultiply", a, b, |x, y| x * y);
    }
    if a.ndim() < 2 || b.ndim() != 2 {
        return Err(RuntimeError::UnimplementedOperation(format!(
            "MatrixMultiply for ranks {} and {}",
            a.ndim(),
            b.ndim()
        )));
    }
    let k = a.shape()[a.ndim() - 1];
    if k != b.shape()[0] {
        return Err(shape_error(
            "MatrixMultiply",
            format!("incompatible shapes {:?} and {:?}", a.shape(), b.shape()),
        ));
    }
    let lead = &a.shape()[..a.ndim() - 1];
    let rows: usize = lead.iter().product();
    let a2 = a.to_shape((rows, k)).map_err(|e| shape_error("MatrixMultiply", e))?;
    let b2 = b.view().into_dimensionality::<Ix2>().map_err(|e| shape_error("MatrixMultiply", e))?;
    let product = a2.dot(&b2);

    let mut out_shape = lead.to_vec();
    out_shape.push(b.shape()[1]);
    product
        .into_shape_with_order(IxDyn(&out_shape))
        .map_err(|e| shape_error("MatrixMultiply", e))
}

fn op_softmax(a: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let axis = last_axis(a, "Softmax")?;
    let mut result = a.clone();
    for mut lane in result.lanes_mut(axis) {
        let max_val = lane.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        lane.mapv_inplace(|x| (x - max_val).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|x| x / sum);
    }
    Ok(result)
}

fn op_log_softmax(a: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let axis = last_axis(a, "LogSoftmax")?;
    let mut result = a.clone();
    for mut lane in result.lanes_mut(axis) {
        let max_val = lane.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        let log_sum = lane.iter().map(|&x| (x - max_val).exp()).sum::<f32>().ln();
        lane.mapv_inplace(|x| x - max_val - log_sum);
    }
    Ok(result)
}

fn op_argmax(a: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let axis = last_axis(a, "ArgMax")?;
    let indices = a.map_axis(axis, |lane| {
        let mut best = 0usize;
        let mut best_val = f32::NEG_INFINITY;
        for (i, &x) in lane.iter().enumerate() {
            if x > best_val {
                best = i;
                best_val = x;
            }
        }
        best as f32
    });
    Ok(indices.insert_axis(axis))
}

fn op_size(a: &ArrayD<f32>, axis: Option<isize>) -> Result<ArrayD<f32>> {
    let count = match axis {
        None => a.len(),
        Some(ax) => {
            let rank = a.ndim() as isize;
            let idx = if ax < 0 { rank + ax } else { ax };
            if idx < 0 || idx >= rank {
                return Err(shape_error("Size", format!("axis {} out of range for rank {}", ax, rank)));
            }
            a.shape()[idx as usize]
        }
    };
    Ok(ndarray::arr0(count as f32).into_dyn())
}

fn op_reshape(a: &ArrayD<f32>, target: &[isize]) -> Result<ArrayD<f32>> {
    let known: usize = target.iter().filter(|&&d| d > 0).map(|&d| d as usize).product();
    let inferred = if known == 0 { 0 } else { a.len() / known };
    if target.iter().any(|&d| d == -1) && inferred * known != a.len() {
        return Err(shape_error("Reshape", format!("cannot reshape {:?} into {:?}", a.shape(), target)));
    }
    let shape: Vec<usize> = target
        .iter()
        .map(|&d| if d < 0 { inferred } else { d as usize })
        .collect();
    reshape_to(a, &shape)
}

fn reshape_to(a: &ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    a.to_shape(IxDyn(shape))
        .map(|view| view.into_owned())
        .map_err(|e| shape_error("Reshape", format!("{:?} -> {:?}: {}", a.shape(), shape, e)))
}

fn op_transpose(a: &ArrayD<f32>, axis1: usize, axis2: usize) -> Result<ArrayD<f32>> {
    if axis1 >= a.ndim() || axis2 >= a.ndim() {
        return Err(shape_error("Transpose", format!("axes ({}, {}) for rank {}", axis1, axis2, a.ndim())));
    }
    let mut axes: Vec<usize> = (0..a.ndim()).collect();
    axes.swap(axis1, axis2);
    Ok(a.view().permuted_axes(axes).as_standard_layout().into_owned())
}

fn op_broadcast(a: &ArrayD<f32>, target: &[usize]) -> Result<ArrayD<f32>> {
    if a.len() == 1 {
        let val = a.iter().next().copied().unwrap_or_default();
        return Ok(ArrayD::from_elem(IxDyn(target), val));
    }
    a.broadcast(target)
        .map(|view| view.to_owned())
        .ok_or_else(|| shape_error("Broadcast", format!("cannot broadcast {:?} to {:?}", a.shape(), target)))
}

/// Sums a broadcast result back down to `target`.
fn op_reduce_sum_to(a: &ArrayD<f32>, target: &[usize]) -> Result<ArrayD<f32>> {
    let mismatch = || shape_error("ReduceSumTo", format!("cannot reduce {:?} to {:?}", a.shape(), target));
    let mut source = a.clone();
    while source.ndim() > target.len() {
        source = source.sum_axis(Axis(0));
    }
    if source.ndim() < target.len() {
        return if source.len() == target.iter().product::<usize>() {
            reshape_to(&source, target)
        } else {
            Err(mismatch())
        };
    }
    for axis in (0..target.len()).rev() {
        let current = source.shape()[axis];
        if current == target[axis] {
            continue;
        }
        if target[axis] != 1 {
            return Err(mismatch());
        }
        source = source.sum_axis(Axis(axis)).insert_axis(Axis(axis));
    }
    Ok(source)
}

fn op_concat(views: &[ArrayViewD<'_, f32>], axis: usize) -> Result<ArrayD<f32>> {
    concatenate(Axis(axis), views).map_err(|e| shape_error("Concat", e))
}

fn op_concat_grad(grad: &ArrayD<f32>, shapes: &[Vec<usize>], axis: usize, index: usize) -> Result<ArrayD<f32>> {
    let axis_len = |s: &Vec<usize>| s.get(axis).copied().ok_or_else(|| shape_error("ConcatGrad", "axis out of range"));
    let offset = shapes[..index.min(shapes.len())]
        .iter()
        .map(axis_len)
        .sum::<Result<usize>>()?;
    let len = shapes
        .get(index)
        .ok_or_else(|| shape_error("ConcatGrad", "index out of range"))
        .and_then(axis_len)?;
    if axis >= grad.ndim() || offset + len > grad.shape()[axis] {
        return Err(shape_error("ConcatGrad", format!("slice {}..{} of {:?}", offset, offset + len, grad.shape())));
    }
    Ok(grad.slice_axis(Axis(axis), Slice::from(offset..offset + len)).to_owned())
}

// --- Windowed ops over NHWC ---

/// Geometry shared by convolution and pooling.
struct Window {
    kernel: (usize, usize),
    strides: (usize, usize),
    pad: (usize, usize),
    input: (usize, usize),
    output: (usize, usize),
}

impl Window {
    fn new(input: (usize, usize), kernel: (usize, usize), strides: (usize, usize), padding: Padding, op: &str) -> Result<Self> {
        let out_h = padding.output_len(input.0, kernel.0, strides.0);
        let out_w = padding.output_len(input.1, kernel.1, strides.1);
        match (out_h, out_w) {
            (Some(oh), Some(ow)) => Ok(Self {
                kernel,
                strides,
                pad: (
                    padding.pad_before(input.0, kernel.0, strides.0),
                    padding.pad_before(input.1, kernel.1, strides.1),
                ),
                input,
                output: (oh, ow),
            }),
            _ => Err(shape_error(op, format!("window {:?} stride {:?} does not fit {:?}", kernel, strides, input))),
        }
    }

    /// Calls `f(oh, ow, kh, kw, ih, iw)` for every in-bounds tap.
    fn for_each_tap(&self, mut f: impl FnMut(usize, usize, usize, usize, usize, usize)) {
        for oh in 0..self.output.0 {
            for ow in 0..self.output.1 {
                for kh in 0..self.kernel.0 {
                    let ih = (oh * self.strides.0 + kh) as isize - self.pad.0 as isize;
                    if ih < 0 || ih >= self.input.0 as isize {
                        continue;
                    }
                    for kw in 0..self.kernel.1 {
                        let iw = (ow * self.strides.1 + kw) as isize - self.pad.1 as isize;
                        if iw < 0 || iw >= self.input.1 as isize {
                            continue;
                        }
                        f(oh, ow, kh, kw, ih as usize, iw as usize);
                    }
                }
            }
        }
    }
}

fn as4<'a>(a: &'a ArrayD<f32>, what: &str) -> Result<ArrayView4<'a, f32>> {
    a.view().into_dimensionality::<Ix4>().map_err(|e| shape_error(what, e))
}

fn conv_window(
    x: &ArrayView4<'_, f32>,
    k: &ArrayView4<'_, f32>,
    strides: (usize, usize),
    padding: Padding,
) -> Result<Window> {
    let (_, h, w, cin) = x.dim();
    let (kh, kw, kcin, _) = k.dim();
    if cin != kcin {
        return Err(shape_error(
            "Conv2d",
            format!("input has {} channels, kernel expects {}", cin, kcin),
        ));
    }
    Window::new((h, w), (kh, kw), strides, padding, "Conv2d")
}

fn op_conv2d(input: &ArrayD<f32>, kernel: &ArrayD<f32>, strides: (usize, usize), padding: Padding) -> Result<ArrayD<f32>> {
    let x = as4(input, "Conv2d input")?;
    let k = as4(kernel, "Conv2d kernel")?;
    let win = conv_window(&x, &k, strides, padding)?;
    let (n, _, _, cin) = x.dim();
    let cout = k.dim().3;

    let mut out = Array4::<f32>::zeros((n, win.output.0, win.output.1, cout));
    for b in 0..n {
        win.for_each_tap(|oh, ow, kh, kw, ih, iw| {
            for ci in 0..cin {
                let xv = x[[b, ih, iw, ci]];
                for co in 0..cout {
                    out[[b, oh, ow, co]] += xv * k[[kh, kw, ci, co]];
                }
            }
        });
    }
    Ok(out.into_dyn())
}

fn op_conv2d_backprop_input(
    input: &ArrayD<f32>,
    kernel: &ArrayD<f32>,
    grad: &ArrayD<f32>,
    strides: (usize, usize),
    padding: Padding,
) -> Result<ArrayD<f32>> {
    let x = as4(input, "Conv2dBackpropInput input")?;
    let k = as4(kernel, "Conv2dBackpropInput kernel")?;
    let g = as4(grad, "Conv2dBackpropInput grad")?;
    let win = conv_window(&x, &k, strides, padding)?;
    let (n, h, w, cin) = x.dim();
    let cout = k.dim().3;

    let mut dx = Array4::<f32>::zeros((n, h, w, cin));
    for b in 0..n {
        win.for_each_tap(|oh, ow, kh, kw, ih, iw| {
            for ci in 0..cin {
                let mut acc = 0.0;
                for co in 0..cout {
                    acc += g[[b, oh, ow, co]] * k[[kh, kw, ci, co]];
                }
                dx[[b, ih, iw, ci]] += acc;
            }
        });
    }
    Ok(dx.into_dyn())
}

fn op_conv2d_backprop_kernel(
    input: &ArrayD<f32>,
    kernel: &ArrayD<f32>,
    grad: &ArrayD<f32>,
    strides: (usize, usize),
    padding: Padding,
) -> Result<ArrayD<f32>> {
    let x = as4(input, "Conv2dBackpropKernel input")?;
    let k = as4(kernel, "Conv2dBackpropKernel kernel")?;
    let g = as4(grad, "Conv2dBackpropKernel grad")?;
    let win = conv_window(&x, &k, strides, padding)?;
    let (n, _, _, cin) = x.dim();

    let mut dk = Array4::<f32>::zeros(k.dim());
    let cout = k.dim().3;
    for b in 0..n {
        win.for_each_tap(|oh, ow, kh, kw, ih, iw| {
            for ci in 0..cin {
                let xv = x[[b, ih, iw, ci]];
                for co in 0..cout {
                    dk[[kh, kw, ci, co]] += xv * g[[b, oh, ow, co]];
                }
            }
        });
    }
    Ok(dk.into_dyn())
}

fn op_max_pool2d(input: &ArrayD<f32>, pool: (usize, usize), strides: (usize, usize), padding: Padding) -> Result<ArrayD<f32>> {
    let x = as4(input, "MaxPool2d input")?;
    let (n, h, w, c) = x.dim();
    let win = Window::new((h, w), pool, strides, padding, "MaxPool2d")?;

    let mut out = Array4::<f32>::from_elem((n, win.output.0, win.output.1, c), f32::NEG_INFINITY);
    for b in 0..n {
        win.for_each_tap(|oh, ow, _, _, ih, iw| {
            for ch in 0..c {
                let cell = &mut out[[b, oh, ow, ch]];
                *cell = cell.max(x[[b, ih, iw, ch]]);
            }
        });
    }
    Ok(out.into_dyn())
}

fn op_max_pool2d_grad(
    input: &ArrayD<f32>,
    grad: &ArrayD<f32>,
    pool: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
) -> Result<ArrayD<f32>> {
    let x = as4(input, "MaxPool2dGrad input")?;
    let g = as4(grad, "MaxPool2dGrad grad")?;
    let (n, h, w, c) = x.dim();
    let win = Window::new((h, w), pool, strides, padding, "MaxPool2dGrad")?;

    // The first maximum of each window receives the whole gradient.
    let out_dim = (n, win.output.0, win.output.1, c);
    let mut best = Array4::<f32>::from_elem(out_dim, f32::NEG_INFINITY);
    let mut best_pos = Array4::<(usize, usize)>::from_elem(out_dim, (0, 0));
    for b in 0..n {
        win.for_each_tap(|oh, ow, _, _, ih, iw| {
            for ch in 0..c {
                let xv = x[[b, ih, iw, ch]];
                if xv > best[[b, oh, ow, ch]] {
                    best[[b, oh, ow, ch]] = xv;
                    best_pos[[b, oh, ow, ch]] = (ih, iw);
                }
            }
        });
    }

    let mut dx = Array4::<f32>::zeros((n, h, w, c));
    for ((b, oh, ow, ch), &(ih, iw)) in best_pos.indexed_iter() {
        dx[[b, ih, iw, ch]] += g[[b, oh, ow, ch]];
    }
    Ok(dx.into_dyn())
}

/// Number of in-bounds taps per output position.
fn window_counts(win: &Window) -> Array3<f32> {
    let mut counts = Array3::<f32>::zeros((win.output.0, win.output.1, 1));
    win.for_each_tap(|oh, ow, _, _, _, _| counts[[oh, ow, 0]] += 1.0);
    counts
}

fn op_avg_pool2d(input: &ArrayD<f32>, pool: (usize, usize), strides: (usize, usize), padding: Padding) -> Result<ArrayD<f32>> {
    let x = as4(input, "AvgPool2d input")?;
    let (n, h, w, c) = x.dim();
    let win = Window::new((h, w), pool, strides, padding, "AvgPool2d")?;
    let counts = window_counts(&win);

    let mut out = Array4::<f32>::zeros((n, win.output.0, win.output.1, c));
    for b in 0..n {
        win.for_each_tap(|oh, ow, _, _, ih, iw| {
            for ch in 0..c {
                out[[b, oh, ow, ch]] += x[[b, ih, iw, ch]] / counts[[oh, ow, 0]];
            }
        });
    }
    Ok(out.into_dyn())
}

fn op_avg_pool2d_grad(
    input: &ArrayD<f32>,
    grad: &ArrayD<f32>,
    pool: (usize, usize),
    strides: (usize, usize),
    padding: Padding,
) -> Result<ArrayD<f32>> {
    let x = as4(input, "AvgPool2dGrad input")?;
    let g = as4(grad, "AvgPool2dGrad grad")?;
    let (n, h, w, c) = x.dim();
    let win = Window::new((h, w), pool, strides, padding, "AvgPool2dGrad")?;
    let counts = window_counts(&win);

    let mut dx = Array4::<f32>::zeros((n, h, w, c));
    for b in 0..n {
        win.for_each_tap(|oh, ow, _, _, ih, iw| {
            for ch in 0..c {
                dx[[b, ih, iw, ch]] += g[[b, oh, ow, ch]] / counts[[oh, ow, 0]];
            }
        });
    }
    Ok(dx.into_dyn())
}

fn op_dropout_mask(shape: &[usize], rate: f32, seed: u64, env: &Environment<'_, ArrayD<f32>>) -> ArrayD<f32> {
    if !env.training || rate <= 0.0 {
        return ArrayD::ones(IxDyn(shape));
    }
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(env.step.wrapping_mul(0x9E37_79B9_7F4A_7C15)));
    let keep = 1.0 - rate;
    let scale = 1.0 / keep;
    ArrayD::from_shape_simple_fn(IxDyn(shape), || if rng.gen::<f32>() < keep { scale } else { 0.0 })
}

fn op_softmax_cross_entropy(logits: &ArrayD<f32>, labels: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let axis = last_axis(logits, "SoftmaxCrossEntropy")?;
    let log_probs = op_log_softmax(logits)?;
    let terms = broadcast_binary("SoftmaxCrossEntropy", labels, &log_probs, |y, lp| if y == 0.0 { 0.0 } else { -y * lp })?;
    if terms.shape() != logits.shape() {
        return Err(shape_error(
            "SoftmaxCrossEntropy",
            format!("labels {:?} do not match logits {:?}", labels.shape(), logits.shape()),
        ));
    }
    Ok(terms.sum_axis(axis).insert_axis(axis))
}

fn op_softmax_cross_entropy_grad(logits: &ArrayD<f32>, labels: &ArrayD<f32>, grad: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let axis = last_axis(logits, "SoftmaxCrossEntropyGrad")?;
    let probs = op_softmax(logits)?;
    let labels = op_broadcast(labels, logits.shape())?;
    let label_mass = labels.sum_axis(axis).insert_axis(axis);
    let scaled = broadcast_binary("SoftmaxCrossEntropyGrad", &probs, &label_mass, |p, m| p * m)?;
    let local = &scaled - &labels;
    broadcast_binary("SoftmaxCrossEntropyGrad", &local, grad, |d, g| d * g)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::TensorShape;
    use crate::tensor::{GraphContext, Tensor};
    use ndarray::array;
    use std::collections::BTreeMap;

    fn run_single(asg: &Asg, root: NodeId, feeds: Memo) -> Result<ArrayD<f32>> {
        let variables = BTreeMap::new();
        let env = Environment { feeds: &feeds, variables: &variables, training: false, step: 0 };
        CpuBackend::new().run(asg, &[root], &env).map(|mut v| v.remove(0))
    }

    type Memo = super::super::backend::Memo<ArrayD<f32>>;

    #[test]
    fn test_broadcast_add_and_mismatch() {
        let a = array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn();
        let b = array![10.0f32, 20.0].into_dyn();
        let sum = broadcast_binary("Add", &a, &b, |x, y| x + y).unwrap();
        assert_eq!(sum, array![[11.0f32, 22.0], [13.0, 24.0]].into_dyn());

        let c = array![1.0f32, 2.0, 3.0].into_dyn();
        assert!(matches!(
            broadcast_binary("Add", &a, &c, |x, y| x + y),
            Err(RuntimeError::ShapeError(_))
        ));
    }

    #[test]
    fn test_reduce_sum_to_undoes_broadcast() {
        let g = ArrayD::from_elem(IxDyn(&[3, 2]), 1.0f32);
        assert_eq!(op_reduce_sum_to(&g, &[2]).unwrap(), array![3.0f32, 3.0].into_dyn());
        assert_eq!(op_reduce_sum_to(&g, &[3, 1]).unwrap(), array![[2.0f32], [2.0], [2.0]].into_dyn());
        assert_eq!(op_reduce_sum_to(&g, &[]).unwrap(), ndarray::arr0(6.0f32).into_dyn());
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let logits = array![[1.0f32, 2.0, 3.0], [0.0, 0.0, 0.0]].into_dyn();
        let probs = op_softmax(&logits).unwrap();
        for row in probs.lanes(Axis(1)) {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!((probs[[1, 0]] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_conv2d_valid_sums_window() {
        let x = ArrayD::from_elem(IxDyn(&[1, 3, 3, 1]), 1.0f32);
        let k = ArrayD::from_elem(IxDyn(&[2, 2, 1, 2]), 1.0f32);
        let out = op_conv2d(&x, &k, (1, 1), Padding::Valid).unwrap();
        assert_eq!(out.shape(), &[1, 2, 2, 2]);
        assert!(out.iter().all(|&v| v == 4.0));

        let same = op_conv2d(&x, &k, (1, 1), Padding::Same).unwrap();
        assert_eq!(same.shape(), &[1, 3, 3, 2]);
    }

    #[test]
    fn test_max_pool_grad_routes_to_max() {
        let x = array![[1.0f32, 5.0], [2.0, 3.0]].into_shape_with_order((1, 2, 2, 1)).unwrap().into_dyn();
        let pooled = op_max_pool2d(&x, (2, 2), (2, 2), Padding::Valid).unwrap();
        assert_eq!(pooled.iter().copied().collect::<Vec<_>>(), vec![5.0]);

        let g = ArrayD::from_elem(IxDyn(&[1, 1, 1, 1]), 2.0f32);
        let dx = op_max_pool2d_grad(&x, &g, (2, 2), (2, 2), Padding::Valid).unwrap();
        assert_eq!(dx.iter().copied().collect::<Vec<_>>(), vec![0.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_softmax_cross_entropy_uniform_logits() {
        let logits = ArrayD::zeros(IxDyn(&[2, 4]));
        let labels = array![[1.0f32, 0.0, 0.0, 0.0], [0.0, 0.0, 1.0, 0.0]].into_dyn();
        let ce = op_softmax_cross_entropy(&logits, &labels).unwrap();
        assert_eq!(ce.shape(), &[2, 1]);
        assert!(ce.iter().all(|&v| (v - 4.0f32.ln()).abs() < 1e-6));
    }

    #[test]
    fn test_run_feeds_inputs_and_reports_missing() {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x", TensorShape::with_unknown_batch(&[2]));
        let y = x.mul_scalar(3.0).sum();
        let asg = ctx.borrow().main_graph().clone();

        let mut feeds = Memo::new();
        feeds.insert(x.node_id, array![[1.0f32, 2.0]].into_dyn());
        assert_eq!(run_single(&asg, y.node_id, feeds).unwrap(), ndarray::arr0(9.0f32).into_dyn());
        assert!(matches!(
            run_single(&asg, y.node_id, Memo::new()),
            Err(RuntimeError::MissingInput(_, _))
        ));
    }

    #[test]
    fn test_dropout_mask_only_in_training() {
        let variables = BTreeMap::new();
        let feeds = Memo::new();
        let eval = Environment { feeds: &feeds, variables: &variables, training: false, step: 0 };
        assert!(op_dropout_mask(&[4, 4], 0.5, 1, &eval).iter().all(|&v| v == 1.0));

        let train = Environment { feeds: &feeds, variables: &variables, training: true, step: 3 };
        let mask = op_dropout_mask(&[8, 8], 0.5, 1, &train);
        assert!(mask.iter().all(|&v| v == 0.0 || v == 2.0));
    }
}
