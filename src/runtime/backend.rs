//! Abstract interface for execution backends.

use crate::asg::{Asg, AsgError, NodeId, Value};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors raised while executing a graph. Shared by all backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Graph error: {0}")]
    Graph(#[from] AsgError),

    #[error("Type mismatch: operation expected {expected}, got {actual}.")]
    TypeError { expected: String, actual: String },

    #[error("Tensor shape error: {0}")]
    ShapeError(String),

    #[error("Missing value for input '{0}' (node ID: {1}). Feed it when running the graph.")]
    MissingInput(String, NodeId),

    #[error("Variable '{0}' (node ID: {1}) has no value. Run its initializer or load it first.")]
    MissingParameter(String, NodeId),

    #[error("Operation '{0}' is not implemented by this backend.")]
    UnimplementedOperation(String),

    #[error("Computation error: {0}")]
    ComputationError(String),
}

/// Values already known before a run, keyed by node.
pub type Memo<T> = HashMap<NodeId, T>;

/// Everything a backend needs besides the graph itself.
pub struct Environment<'a, T> {
    /// Values fed for `Input` nodes (or any node to short-circuit).
    pub feeds: &'a Memo<T>,
    /// Current variable values, by name.
    pub variables: &'a BTreeMap<String, T>,
    /// Enables training-only behaviour such as dropout masks.
    pub training: bool,
    /// Monotonic run counter, mixed into random seeds.
    pub step: u64,
}

/// Common interface for an execution runtime.
///
/// A backend evaluates the nodes needed for `roots` and returns their values
/// in the same order. It never mutates variables; committing `Assign`
/// results is the caller's job.
pub trait Backend {
    /// Device-resident tensor representation.
    type DeviceData: std::fmt::Debug + Clone;

    /// Moves host values to the device.
    fn load_data(&self, data: Vec<Value>) -> Result<Vec<Self::DeviceData>, RuntimeError>;

    fn run(
        &self,
        asg: &Asg,
        roots: &[NodeId],
        env: &Environment<'_, Self::DeviceData>,
    ) -> Result<Vec<Self::DeviceData>, RuntimeError>;

    /// Copies device data back to host values.
    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError>;
}
