//! Runtime session: variable storage plus feed/fetch/target execution.

use super::backend::{Backend, Environment, Memo, RuntimeError};
use crate::asg::{Asg, NodeId, NodeType, Value};
use ndarray::ArrayD;
use std::collections::{BTreeMap, HashMap};

/// Holds the current value of every variable and runs graphs against them.
///
/// `Assign` targets of one run are computed from the values the variables had
/// before that run and are committed together only when the whole run
/// succeeds, so a failing batch leaves every variable untouched.
#[derive(Debug)]
pub struct Session<B: Backend> {
    backend: B,
    variables: BTreeMap<String, B::DeviceData>,
    step: u64,
}

impl<B: Backend> Session<B> {
    pub fn new(backend: B) -> Self {
        Self { backend, variables: BTreeMap::new(), step: 0 }
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    /// Reads the current value of a variable.
    pub fn variable(&self, name: &str) -> Result<ArrayD<f32>, RuntimeError> {
        let data = self
            .variables
            .get(name)
            .ok_or_else(|| RuntimeError::MissingParameter(name.to_string(), 0))?;
        let mut values = self.backend.retrieve_data(std::slice::from_ref(data))?;
        values
            .pop()
            .map(Value::into_array)
            .ok_or_else(|| RuntimeError::ComputationError(format!("backend returned nothing for '{}'", name)))
    }

    /// Injects a value for a variable, replacing any previous one.
    pub fn set_variable(&mut self, name: &str, value: ArrayD<f32>) -> Result<(), RuntimeError> {
        let data = self
            .backend
            .load_data(vec![Value::Tensor(value)])?
            .pop()
            .ok_or_else(|| RuntimeError::ComputationError(format!("backend loaded nothing for '{}'", name)))?;
        self.variables.insert(name.to_string(), data);
        Ok(())
    }

    pub fn remove_variable(&mut self, name: &str) -> bool {
        self.variables.remove(name).is_some()
    }

    pub fn clear(&mut self) {
        self.variables.clear();
    }

    /// Number of training runs executed so far.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Evaluates `fetches` and executes `targets` in one pass.
    ///
    /// Every target must be an `Assign` node. Returns the fetched values in
    /// request order.
    pub fn run(
        &mut self,
        asg: &Asg,
        feeds: &HashMap<NodeId, ArrayD<f32>>,
        fetches: &[NodeId],
        targets: &[NodeId],
        training: bool,
    ) -> Result<Vec<ArrayD<f32>>, RuntimeError> {
        let mut assigned = Vec::with_capacity(targets.len());
        for &target in targets {
            match &asg.get_node(target)?.node_type {
                NodeType::Assign { variable, .. } => assigned.push(variable.clone()),
                other => {
                    return Err(RuntimeError::TypeError {
                        expected: "Assign".to_string(),
                        actual: other.op_name().to_string(),
                    })
                }
            }
        }

        let mut device_feeds: Memo<B::DeviceData> = HashMap::with_capacity(feeds.len());
        let ids: Vec<NodeId> = feeds.keys().copied().collect();
        let loaded = self
            .backend
            .load_data(ids.iter().filter_map(|id| feeds.get(id)).cloned().map(Value::Tensor).collect())?;
        device_feeds.extend(ids.into_iter().zip(loaded));

        let mut roots = fetches.to_vec();
        roots.extend_from_slice(targets);
        let env = Environment {
            feeds: &device_feeds,
            variables: &self.variables,
            training,
            step: self.step,
        };
        let mut results = self.backend.run(asg, &roots, &env)?;
        let updates = results.split_off(fetches.len());
        let fetched = self.backend.retrieve_data(&results)?;

        for (name, data) in assigned.into_iter().zip(updates) {
            self.variables.insert(name, data);
        }
        if training {
            self.step += 1;
        }
        Ok(fetched.into_iter().map(Value::into_array).collect())
    }
}
