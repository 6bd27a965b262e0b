//! # graphtrain: graph construction and training engine
//!
//! **graphtrain** turns a declarative list of layers into a stateful
//! computational graph (an ASG, abstract semantic graph), allocates and
//! initializes its parameters, trains them with a pluggable optimizer and
//! loss, and saves or restores checkpoints.
//!
//! The pieces, bottom-up:
//!
//! - [`asg`], [`tensor`], [`autograd`], [`runtime`]: the graph IR, its symbolic
//!   builder, reverse-mode differentiation and the CPU executor.
//! - [`state`]: the single registry of variables, initializers and optimizer slots.
//! - [`layers`]: shape inference and variable allocation per layer.
//! - [`losses`], [`metrics`], [`optimizers`], [`regularizers`], [`initializers`].
//! - [`network`]: the model lifecycle with `fit`, `evaluate` and `predict`.
//! - [`callbacks`], [`history`]: hooks into the training loop and its record.
//!
//! ## Usage Example
//!
//! ```no_run
//! use graphtrain::config::{FitConfig, TrainingContext};
//! use graphtrain::data::Dataset;
//! use graphtrain::layers::{Activation, Dense, Input, Layer};
//! use graphtrain::losses::{Loss, LossKind};
//! use graphtrain::metrics::MetricKind;
//! use graphtrain::network::Network;
//! use graphtrain::optimizers::Optimizer;
//! use ndarray::ArrayD;
//!
//! # fn main() -> graphtrain::error::Result<()> {
//! let ctx = TrainingContext::default();
//! let mut network = Network::sequential(
//!     "mlp",
//!     vec![
//!         Layer::new(Input::new(&[4])),
//!         Layer::new(Dense::new(8).with_activation(Activation::Relu)),
//!         Layer::new(Dense::new(3).with_activation(Activation::Linear)),
//!     ],
//! )?;
//! network.compile(Loss::new(LossKind::Mse), Optimizer::sgd(0.1)?, &[MetricKind::Mae], &ctx)?;
//!
//! let data = Dataset::new(ArrayD::zeros(ndarray::IxDyn(&[6, 4])), ArrayD::zeros(ndarray::IxDyn(&[6, 3])))?;
//! let history = network.fit(&data, None, &FitConfig::new(5, 2), &mut [], &ctx)?;
//! println!("final loss: {:?}", history.last_epoch_event().map(|e| e.loss));
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod callbacks;
pub mod config;
pub mod data;
pub mod error;
pub mod history;
pub mod initializers;
pub mod layers;
pub mod losses;
pub mod metrics;
pub mod network;
pub mod optimizers;
pub mod regularizers;
pub mod runtime;
pub mod serialization;
pub mod shape;
pub mod state;
pub mod tensor;
