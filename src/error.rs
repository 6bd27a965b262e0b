//! Crate-wide error taxonomy.
//!
//! Lower layers (graph IR, shape inference, autograd, runtime, checkpoints)
//! keep their own error enums; everything above them reports through
//! [`Error`], which wraps those enums and adds the engine-level categories.

use crate::analysis::shape_inference::ShapeInferenceError;
use crate::asg::AsgError;
use crate::autograd::AutogradError;
use crate::runtime::backend::RuntimeError;
use crate::serialization::checkpoint::CheckpointError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid hyperparameter or unsupported policy, rejected at construction or compile time.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A layer produced or received a shape it cannot work with.
    #[error("Shape error in layer '{layer}': {message}")]
    Shape { layer: String, message: String },

    /// A variable, initializer or slot was registered twice under the same name.
    #[error("{what} '{name}' is registered already")]
    Duplicate { what: &'static str, name: String },

    /// An operation was called in a state of the model lifecycle that does not allow it.
    #[error("Lifecycle violation: {0}")]
    Lifecycle(String),

    #[error("Slot '{slot}' for variable '{variable}' does not exist; slots must be created before they are read")]
    MissingSlot { variable: String, slot: String },

    #[error("Variable '{0}' is not registered in the graph state")]
    UnknownVariable(String),

    #[error("Graph error: {0}")]
    Graph(#[from] AsgError),

    #[error("Shape inference error: {0}")]
    ShapeInference(#[from] ShapeInferenceError),

    #[error("Autograd error: {0}")]
    Autograd(#[from] AutogradError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Configuration(message.into())
    }

    pub(crate) fn lifecycle(message: impl Into<String>) -> Self {
        Error::Lifecycle(message.into())
    }

    pub(crate) fn shape(layer: &str, message: impl Into<String>) -> Self {
        Error::Shape {
            layer: layer.to_string(),
            message: message.into(),
        }
    }
}
