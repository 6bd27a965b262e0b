//! Graph state: the single registry of variables, their initializers and
//! optimizer slots for one network.
//!
//! Every parameter of a model and every tensor of optimizer state is created
//! here, exactly once, under a unique name. Registration is all-or-nothing:
//! a rejected call leaves the registry exactly as it was.

use crate::asg::NodeId;
use crate::error::{Error, Result};
use crate::initializers::Initializer;
use crate::regularizers::Regularizer;
use crate::runtime::cpu_backend::CpuBackend;
use crate::runtime::session::Session;
use crate::tensor::{GraphContext, Tensor};
use log::trace;
use ndarray::ArrayD;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Reserved prefix of every optimizer-owned variable.
pub const OPTIMIZER_PREFIX: &str = "optimizer_";

/// Name of the initializer op of a variable.
pub fn initializer_name(variable: &str) -> String {
    format!("Init_{}", variable)
}

/// Name of the slot variable `slot` of `variable`.
pub fn slot_variable_name(variable: &str, slot: &str) -> String {
    format!("{}{}-{}", OPTIMIZER_PREFIX, variable, slot)
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub trainable: bool,
    pub node: NodeId,
}

impl VariableSpec {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Deferred initialization of one variable.
#[derive(Debug, Clone, PartialEq)]
struct InitOp {
    name: String,
    variable: String,
    initializer: Initializer,
    fan_in: usize,
    fan_out: usize,
}

pub struct GraphState {
    context: Rc<RefCell<GraphContext>>,
    session: Session<CpuBackend>,
    variables: Vec<VariableSpec>,
    optimizer_variables: Vec<VariableSpec>,
    index: HashMap<String, (bool, usize)>,
    initializers: Vec<InitOp>,
    optimizer_initializers: Vec<InitOp>,
    /// slot name -> variable name -> slot variable name
    slots: HashMap<String, HashMap<String, String>>,
    regularizers: Vec<(String, Regularizer)>,
}

impl std::fmt::Debug for GraphState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphState")
            .field("variables", &self.variables.len())
            .field("optimizer_variables", &self.optimizer_variables.len())
            .field("initializers", &self.initializers.len())
            .field("slots", &self.slots.len())
            .finish()
    }
}

impl Default for GraphState {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphState {
    pub fn new() -> Self {
        Self {
            context: GraphContext::shared(),
            session: Session::new(CpuBackend::new()),
            variables: Vec::new(),
            optimizer_variables: Vec::new(),
            index: HashMap::new(),
            initializers: Vec::new(),
            optimizer_initializers: Vec::new(),
            slots: HashMap::new(),
            regularizers: Vec::new(),
        }
    }

    pub fn context(&self) -> &Rc<RefCell<GraphContext>> {
        &self.context
    }

    pub fn session(&self) -> &Session<CpuBackend> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session<CpuBackend> {
        &mut self.session
    }

    fn ensure_unregistered(&self, name: &str) -> Result<()> {
        if self.index.contains_key(name) {
            return Err(Error::Duplicate { what: "variable", name: name.to_string() });
        }
        Ok(())
    }

    fn register(&mut self, name: &str, shape: &[usize], trainable: bool, optimizer: bool) -> Tensor {
        let tensor = Tensor::new_variable(&self.context, name, shape);
        let spec = VariableSpec {
            name: name.to_string(),
            shape: shape.to_vec(),
            trainable,
            node: tensor.node_id,
        };
        let list = if optimizer { &mut self.optimizer_variables } else { &mut self.variables };
        list.push(spec);
        self.index.insert(name.to_string(), (optimizer, list.len() - 1));
        tensor
    }

    /// Registers a model variable and returns the tensor reading it.
    pub fn add_variable(&mut self, name: &str, shape: &[usize], trainable: bool) -> Result<Tensor> {
        if name.starts_with(OPTIMIZER_PREFIX) {
            return Err(Error::config(format!(
                "variable name '{}' uses the reserved prefix '{}'",
                name, OPTIMIZER_PREFIX
            )));
        }
        if shape.iter().any(|&d| d == 0) {
            return Err(Error::shape(name, format!("variable shape {:?} has a zero dimension", shape)));
        }
        self.ensure_unregistered(name)?;
        trace!(variable = name, trainable = trainable; "variable registered");
        Ok(self.register(name, shape, trainable, false))
    }

    /// Registers the initializer op `Init_<variable>`.
    pub fn add_initializer(&mut self, variable: &str, initializer: Initializer, fan_in: usize, fan_out: usize) -> Result<()> {
        let name = initializer_name(variable);
        let is_optimizer = match self.index.get(variable) {
            Some((optimizer, _)) => *optimizer,
            None => return Err(Error::UnknownVariable(variable.to_string())),
        };
        let list = if is_optimizer { &self.optimizer_initializers } else { &self.initializers };
        if list.iter().any(|op| op.name == name) {
            return Err(Error::Duplicate { what: "initializer", name });
        }
        initializer.validate()?;
        let op = InitOp { name, variable: variable.to_string(), initializer, fan_in, fan_out };
        if is_optimizer {
            self.optimizer_initializers.push(op);
        } else {
            self.initializers.push(op);
        }
        Ok(())
    }

    /// Registers optimizer-owned state (not a slot), e.g. `optimizer_beta1_power`.
    pub fn add_optimizer_variable(&mut self, name: &str, shape: &[usize], initializer: Initializer) -> Result<Tensor> {
        if !name.starts_with(OPTIMIZER_PREFIX) {
            return Err(Error::config(format!(
                "optimizer variable '{}' must start with '{}'",
                name, OPTIMIZER_PREFIX
            )));
        }
        self.ensure_unregistered(name)?;
        initializer.validate()?;
        let tensor = self.register(name, shape, false, true);
        self.optimizer_initializers.push(InitOp {
            name: initializer_name(name),
            variable: name.to_string(),
            initializer,
            fan_in: 0,
            fan_out: 0,
        });
        Ok(tensor)
    }

    /// Allocates slot `slot` for `variable`, shaped like the variable.
    /// Creating the same slot twice is a build-logic error.
    pub fn create_slot(&mut self, variable: &str, slot: &str, initializer: Initializer) -> Result<Tensor> {
        let shape = self
            .variable_spec(variable)
            .map(|spec| spec.shape.clone())
            .ok_or_else(|| Error::UnknownVariable(variable.to_string()))?;
        if self.slots.get(slot).is_some_and(|by_var| by_var.contains_key(variable)) {
            return Err(Error::Duplicate {
                what: "slot",
                name: slot_variable_name(variable, slot),
            });
        }
        let slot_name = slot_variable_name(variable, slot);
        let tensor = self.add_optimizer_variable(&slot_name, &shape, initializer)?;
        self.slots
            .entry(slot.to_string())
            .or_default()
            .insert(variable.to_string(), slot_name);
        Ok(tensor)
    }

    pub fn get_slot(&self, variable: &str, slot: &str) -> Result<Tensor> {
        let missing = || Error::MissingSlot { variable: variable.to_string(), slot: slot.to_string() };
        let slot_name = self.slots.get(slot).and_then(|by_var| by_var.get(variable)).ok_or_else(missing)?;
        let spec = self.variable_spec(slot_name).ok_or_else(missing)?;
        Ok(Tensor::from_node(&self.context, spec.node))
    }

    pub fn slot_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.slots.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn add_regularizer(&mut self, variable: &str, regularizer: Regularizer) -> Result<()> {
        if self.variable_spec(variable).is_none() {
            return Err(Error::UnknownVariable(variable.to_string()));
        }
        if self.regularizers.iter().any(|(name, _)| name == variable) {
            return Err(Error::Duplicate { what: "regularizer", name: variable.to_string() });
        }
        regularizer.validate()?;
        self.regularizers.push((variable.to_string(), regularizer));
        Ok(())
    }

    pub fn regularizers(&self) -> &[(String, Regularizer)] {
        &self.regularizers
    }

    pub fn variable_spec(&self, name: &str) -> Option<&VariableSpec> {
        let (optimizer, position) = *self.index.get(name)?;
        if optimizer {
            self.optimizer_variables.get(position)
        } else {
            self.variables.get(position)
        }
    }

    pub fn variable_tensor(&self, name: &str) -> Result<Tensor> {
        self.variable_spec(name)
            .map(|spec| Tensor::from_node(&self.context, spec.node))
            .ok_or_else(|| Error::UnknownVariable(name.to_string()))
    }

    /// Model variables in registration order.
    pub fn all_variables(&self) -> &[VariableSpec] {
        &self.variables
    }

    pub fn trainable_variables(&self) -> Vec<&VariableSpec> {
        self.variables.iter().filter(|v| v.trainable).collect()
    }

    pub fn frozen_variables(&self) -> Vec<&VariableSpec> {
        self.variables.iter().filter(|v| !v.trainable).collect()
    }

    pub fn optimizer_variables(&self) -> &[VariableSpec] {
        &self.optimizer_variables
    }

    pub fn is_optimizer_variable(&self, name: &str) -> bool {
        matches!(self.index.get(name), Some((true, _)))
    }

    /// Runs every model initializer, overwriting current values.
    pub fn run_initializers(&mut self) -> Result<()> {
        let ops = std::mem::take(&mut self.initializers);
        let result = self.run_ops(&ops);
        self.initializers = ops;
        result
    }

    pub fn run_optimizer_initializers(&mut self) -> Result<()> {
        let ops = std::mem::take(&mut self.optimizer_initializers);
        let result = self.run_ops(&ops);
        self.optimizer_initializers = ops;
        result
    }

    fn run_ops(&mut self, ops: &[InitOp]) -> Result<()> {
        // Values are computed first so a failing initializer leaves state untouched.
        let mut values = Vec::with_capacity(ops.len());
        for op in ops {
            let spec = self
                .variable_spec(&op.variable)
                .ok_or_else(|| Error::UnknownVariable(op.variable.clone()))?;
            let value = op.initializer.initialize(op.fan_in, op.fan_out, &spec.shape)?;
            values.push((op.variable.clone(), value));
        }
        for (name, value) in values {
            self.session.set_variable(&name, value)?;
        }
        Ok(())
    }

    /// Variables without a registered initializer.
    pub fn uninitialized_variables(&self) -> Vec<&str> {
        self.variables
            .iter()
            .filter(|v| !self.initializers.iter().any(|op| op.variable == v.name))
            .map(|v| v.name.as_str())
            .collect()
    }

    pub fn has_value(&self, name: &str) -> bool {
        self.session.has_variable(name)
    }

    pub fn value(&self, name: &str) -> Result<ArrayD<f32>> {
        if self.variable_spec(name).is_none() {
            return Err(Error::UnknownVariable(name.to_string()));
        }
        Ok(self.session.variable(name)?)
    }

    /// Replaces the value of a registered variable; the shape must match.
    pub fn set_value(&mut self, name: &str, value: ArrayD<f32>) -> Result<()> {
        let spec = self
            .variable_spec(name)
            .ok_or_else(|| Error::UnknownVariable(name.to_string()))?;
        if value.shape() != spec.shape.as_slice() {
            return Err(Error::shape(
                name,
                format!("expected value of shape {:?}, got {:?}", spec.shape, value.shape()),
            ));
        }
        self.session.set_variable(name, value)?;
        Ok(())
    }

    /// Runs the graph of this state against its session.
    pub fn run(
        &mut self,
        feeds: &HashMap<NodeId, ArrayD<f32>>,
        fetches: &[NodeId],
        targets: &[NodeId],
        training: bool,
    ) -> Result<Vec<ArrayD<f32>>> {
        let context = Rc::clone(&self.context);
        let graph = context.borrow();
        Ok(self.session.run(graph.main_graph(), feeds, fetches, targets, training)?)
    }

    /// Drops every value held by the session; registrations stay.
    pub fn clear_values(&mut self) {
        self.session.clear();
    }
}
