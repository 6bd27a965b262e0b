//! Activation functions, expressed as graph patterns over primitive ops.

use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum Activation {
    /// Identity.
    #[default]
    Linear,
    Relu,
    /// `min(max(x, 0), 6)`
    Relu6,
    /// `x` for positive inputs, `alpha * (exp(x) - 1)` otherwise.
    Elu { alpha: f32 },
    LeakyRelu { alpha: f32 },
    Sigmoid,
    /// Piecewise-linear sigmoid, `clip(0.2 x + 0.5, 0, 1)`.
    HardSigmoid,
    Tanh,
    Softmax,
    Softplus,
    /// `x / (|x| + 1)`
    Softsign,
    /// `x * sigmoid(x)`
    Swish,
    Exponential,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> Tensor {
        match *self {
            Activation::Linear => x.clone(),
            Activation::Relu => x.relu(),
            Activation::Relu6 => x.relu().minimum_scalar(6.0),
            Activation::Elu { alpha } => {
                let negative = x.minimum_scalar(0.0).exp().add_scalar(-1.0).mul_scalar(alpha);
                &x.relu() + &negative
            }
            Activation::LeakyRelu { alpha } => {
                let scaled = x.mul_scalar(alpha);
                if alpha <= 1.0 {
                    x.maximum(&scaled)
                } else {
                    x.minimum(&scaled)
                }
            }
            Activation::Sigmoid => x.sigmoid(),
            Activation::HardSigmoid => x.mul_scalar(0.2).add_scalar(0.5).clip(0.0, 1.0),
            Activation::Tanh => x.tanh(),
            Activation::Softmax => x.softmax(),
            Activation::Softplus => x.softplus(),
            Activation::Softsign => x / &x.abs().add_scalar(1.0),
            Activation::Swish => x * &x.sigmoid(),
            Activation::Exponential => x.exp(),
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activation::Elu { alpha } => write!(f, "Elu(alpha={})", alpha),
            Activation::LeakyRelu { alpha } => write!(f, "LeakyRelu(alpha={})", alpha),
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::cpu_backend::CpuBackend;
    use crate::runtime::session::Session;
    use crate::shape::TensorShape;
    use crate::tensor::GraphContext;
    use ndarray::{array, ArrayD};
    use std::collections::HashMap;

    fn eval(activation: Activation, input: ArrayD<f32>) -> Vec<f32> {
        let ctx = GraphContext::shared();
        let x = Tensor::new_input(&ctx, "x", TensorShape::with_unknown_batch(&[input.shape()[1]]));
        let y = activation.apply(&x);
        let asg = ctx.borrow().main_graph().clone();
        let mut feeds = HashMap::new();
        feeds.insert(x.node_id, input);
        let mut session = Session::new(CpuBackend::new());
        let out = session.run(&asg, &feeds, &[y.node_id], &[], false).unwrap();
        out[0].iter().copied().collect()
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-5, "{:?} != {:?}", actual, expected);
        }
    }

    #[test]
    fn test_piecewise_activations() {
        let input = array![[-2.0f32, 0.0, 3.0, 8.0]].into_dyn();
        assert_close(&eval(Activation::Relu6, input.clone()), &[0.0, 0.0, 3.0, 6.0]);
        assert_close(&eval(Activation::LeakyRelu { alpha: 0.1 }, input.clone()), &[-0.2, 0.0, 3.0, 8.0]);
        assert_close(&eval(Activation::HardSigmoid, input.clone()), &[0.1, 0.5, 1.0, 1.0]);
        assert_close(
            &eval(Activation::Elu { alpha: 1.0 }, input),
            &[(-2.0f32).exp() - 1.0, 0.0, 3.0, 8.0],
        );
    }

    #[test]
    fn test_smooth_activations() {
        let input = array![[-1.0f32, 0.0, 1.0]].into_dyn();
        assert_close(&eval(Activation::Softsign, input.clone()), &[-0.5, 0.0, 0.5]);
        let s = 1.0 / (1.0 + (-1.0f32).exp());
        assert_close(&eval(Activation::Swish, input.clone()), &[-(1.0 - s), 0.0, s]);
        let softmax = eval(Activation::Softmax, input);
        assert!((softmax.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }
}
