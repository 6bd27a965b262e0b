//! Networks: layers composed into a trainable model.
//!
//! A [`Network`] keeps its layers in an arena indexed by [`LayerId`]; the
//! connections are `(from, to)` index pairs, so a functional (DAG) model has
//! no reference cycles and serializes as plain data. A layer can only take
//! inputs from layers added before it, which makes the arena order a
//! topological order.
//!
//! Lifecycle:
//!
//! ```text
//! Defined --build--> Built --compile--> Compiled --init/fit/load--> Initialized
//!    \__________________________________________________________________\--close--> Closed
//! ```
//!
//! Calls out of order fail with [`Error::Lifecycle`].

mod persistence;
mod summary;
mod training;

pub use self::summary::{LayerSummary, ModelSummary};
pub use self::training::EvaluationResult;

use crate::config::TrainingContext;
use crate::error::{Error, Result};
use crate::layers::{Layer, LayerKind};
use crate::losses::Loss;
use crate::metrics::MetricKind;
use crate::optimizers::Optimizer;
use crate::shape::TensorShape;
use crate::state::GraphState;
use crate::tensor::Tensor;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Index of a layer in its network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Topology {
    /// Every layer takes the previous one as its only input.
    Sequential,
    /// Arbitrary DAG with one input layer and one output layer.
    Functional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Defined,
    Built,
    Compiled,
    /// Compiled, and every model variable has a value.
    Initialized,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Defined => "defined",
            Phase::Built => "built",
            Phase::Compiled => "compiled",
            Phase::Initialized => "initialized",
            Phase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Serializable architecture of a network: the `modelConfig.json` contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub topology: Topology,
    pub layers: Vec<Layer>,
    pub edges: Vec<(usize, usize)>,
}

/// Graph handles created by `compile`.
#[derive(Debug, Clone)]
pub(crate) struct Compiled {
    pub loss: Loss,
    pub optimizer: Optimizer,
    pub metrics: Vec<MetricKind>,
    pub labels: Tensor,
    pub loss_op: Tensor,
    pub prediction: Tensor,
    pub metric_ops: Vec<Tensor>,
    pub targets: Vec<Tensor>,
}

pub struct Network {
    name: String,
    topology: Topology,
    layers: Vec<Layer>,
    edges: Vec<(usize, usize)>,
    state: GraphState,
    phase: Phase,
    input: Option<Tensor>,
    output: Option<Tensor>,
    compiled: Option<Compiled>,
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("name", &self.name)
            .field("topology", &self.topology)
            .field("layers", &self.layers.len())
            .field("phase", &self.phase)
            .finish()
    }
}

impl Network {
    fn empty(name: &str, topology: Topology) -> Self {
        Self {
            name: name.to_string(),
            topology,
            layers: Vec::new(),
            edges: Vec::new(),
            state: GraphState::new(),
            phase: Phase::Defined,
            input: None,
            output: None,
            compiled: None,
        }
    }

    /// A chain of layers; the first one must be an [`Input`](crate::layers::Input).
    pub fn sequential(name: &str, layers: Vec<Layer>) -> Result<Self> {
        let mut network = Self::empty(name, Topology::Sequential);
        match layers.first() {
            Some(first) if first.kind.is_input() => {}
            _ => return Err(Error::config("a sequential network starts with an Input layer")),
        }
        for (position, layer) in layers.iter().enumerate() {
            if position > 0 && layer.kind.is_input() {
                return Err(Error::config("a sequential network has exactly one Input layer"));
            }
            if layer.kind.is_merge() {
                return Err(Error::config(format!(
                    "{} layers need several inputs and cannot be used in a sequential network",
                    layer.type_name()
                )));
            }
        }
        network.edges = (1..layers.len()).map(|i| (i - 1, i)).collect();
        network.layers = layers;
        Ok(network)
    }

    /// An empty DAG network; add layers with [`Network::add`].
    pub fn functional(name: &str) -> Self {
        Self::empty(name, Topology::Functional)
    }

    /// Appends a layer fed by `inputs`, in order. Functional networks only.
    pub fn add(&mut self, layer: Layer, inputs: &[LayerId]) -> Result<LayerId> {
        if self.topology != Topology::Functional {
            return Err(Error::config("layers are added to sequential networks at construction"));
        }
        self.require_phase(Phase::Defined, "add layers")?;
        let id = self.layers.len();
        if layer.kind.is_input() != inputs.is_empty() {
            return Err(Error::config(format!(
                "layer #{} ({}) has {} inbound layers; only Input layers have none",
                id,
                layer.type_name(),
                inputs.len()
            )));
        }
        if let Some(bad) = inputs.iter().find(|input| input.0 >= id) {
            return Err(Error::config(format!("inbound layer #{} does not exist yet", bad.0)));
        }
        self.edges.extend(inputs.iter().map(|input| (input.0, id)));
        self.layers.push(layer);
        Ok(LayerId(id))
    }

    /// Recreates an unbuilt network from its configuration.
    pub fn from_config(config: ModelConfig) -> Result<Self> {
        let ModelConfig { name, topology, layers, edges } = config;
        match topology {
            Topology::Sequential => Self::sequential(&name, layers),
            Topology::Functional => {
                let mut network = Self::functional(&name);
                for (id, layer) in layers.into_iter().enumerate() {
                    let inputs: Vec<LayerId> =
                        edges.iter().filter(|(_, to)| *to == id).map(|(from, _)| LayerId(*from)).collect();
                    network.add(layer, &inputs)?;
                }
                Ok(network)
            }
        }
    }

    pub fn to_config(&self) -> ModelConfig {
        ModelConfig {
            name: self.name.clone(),
            topology: self.topology,
            layers: self.layers.iter().map(Layer::unbuilt).collect(),
            edges: self.edges.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Inbound layers of `id`, in input order.
    pub fn inbound(&self, id: usize) -> Vec<usize> {
        self.edges.iter().filter(|(_, to)| *to == id).map(|(from, _)| *from).collect()
    }

    pub fn state(&self) -> &GraphState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        if self.phase == Phase::Compiled && self.has_model_values() {
            Phase::Initialized
        } else {
            self.phase
        }
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.phase(), Phase::Compiled | Phase::Initialized)
    }

    pub(crate) fn has_model_values(&self) -> bool {
        self.state.all_variables().iter().all(|v| self.state.has_value(&v.name))
    }

    fn require_phase(&self, expected: Phase, action: &str) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(Error::lifecycle(format!(
                "cannot {} on network '{}': it is {}, expected {}",
                action,
                self.name,
                self.phase(),
                expected
            )))
        }
    }

    pub(crate) fn require_compiled(&self, action: &str) -> Result<&Compiled> {
        match (&self.compiled, self.phase) {
            (Some(compiled), Phase::Compiled) => Ok(compiled),
            _ => Err(Error::lifecycle(format!(
                "cannot {} on network '{}': it is {}, compile it first",
                action,
                self.name,
                self.phase()
            ))),
        }
    }

    /// Compiled, with every model variable holding a value.
    pub(crate) fn require_initialized(&self, action: &str) -> Result<&Compiled> {
        let compiled = self.require_compiled(action)?;
        let missing: Vec<&str> = self
            .state
            .all_variables()
            .iter()
            .filter(|v| !self.state.has_value(&v.name))
            .map(|v| v.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(Error::lifecycle(format!(
                "cannot {} on network '{}': variables without values: {}",
                action,
                self.name,
                missing.join(", ")
            )));
        }
        Ok(compiled)
    }

    /// Gives every unnamed layer `<type>_<n>`, one counter over the model,
    /// skipping names that explicitly named layers already use.
    fn assign_names(&mut self) -> Result<()> {
        let mut taken = HashSet::new();
        for layer in self.layers.iter().filter(|l| !l.name.is_empty()) {
            if !taken.insert(layer.name.clone()) {
                return Err(Error::config(format!("layer name '{}' is used twice", layer.name)));
            }
        }
        let mut counter = 0;
        for layer in self.layers.iter_mut().filter(|l| l.name.is_empty()) {
            let prefix = layer.kind.default_name_prefix();
            let name = loop {
                counter += 1;
                let candidate = format!("{}_{}", prefix, counter);
                if !taken.contains(&candidate) {
                    break candidate;
                }
            };
            taken.insert(name.clone());
            layer.name = name;
        }
        Ok(())
    }

    fn output_index(&self) -> Result<usize> {
        let sinks: Vec<usize> =
            (0..self.layers.len()).filter(|id| !self.edges.iter().any(|(from, _)| from == id)).collect();
        match sinks.as_slice() {
            [single] => Ok(*single),
            _ => Err(Error::config(format!("network '{}' must have exactly one output layer, found {}", self.name, sinks.len()))),
        }
    }

    /// Propagates shapes from the input to the output, registers every
    /// variable and builds the forward graph.
    pub fn build(&mut self, ctx: &TrainingContext) -> Result<()> {
        self.require_phase(Phase::Defined, "build")?;
        let inputs: Vec<usize> = (0..self.layers.len()).filter(|&i| self.layers[i].kind.is_input()).collect();
        let input_index = match inputs.as_slice() {
            [single] => *single,
            _ => return Err(Error::config(format!("network '{}' must have exactly one Input layer", self.name))),
        };
        let output_index = self.output_index()?;
        self.assign_names()?;

        let input_shape = match &self.layers[input_index].kind {
            LayerKind::Input(input) => input.tensor_shape(),
            _ => return Err(Error::config("the input layer is not an Input")),
        };
        let placeholder = Tensor::new_input(self.state.context(), "x", input_shape);
        let output = match self.build_layers(&placeholder, output_index, ctx) {
            Ok(output) => output,
            Err(e) => {
                self.roll_back_build();
                return Err(e);
            }
        };

        self.input = Some(placeholder);
        self.output = Some(output);
        self.phase = Phase::Built;
        if ctx.logs_epochs() {
            info!(target: ctx.target.as_str(), network = self.name.as_str(), layers = self.layers.len(), variables = self.state.all_variables().len(); "network built");
        }
        Ok(())
    }

    /// Builds every layer in arena order and returns the output layer's tensor.
    fn build_layers(&mut self, placeholder: &Tensor, output_index: usize, ctx: &TrainingContext) -> Result<Tensor> {
        let mut shapes: Vec<Option<TensorShape>> = vec![None; self.layers.len()];
        let mut outputs: Vec<Option<Tensor>> = vec![None; self.layers.len()];
        for id in 0..self.layers.len() {
            let inbound = self.inbound(id);
            let in_shapes = inbound
                .iter()
                .map(|&from| shapes[from].clone())
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| Error::lifecycle(format!("layer #{} is reached before its inputs", id)))?;
            let in_tensors: Vec<Tensor> = if inbound.is_empty() {
                vec![placeholder.clone()]
            } else {
                inbound.iter().filter_map(|&from| outputs[from].clone()).collect()
            };

            let layer = &mut self.layers[id];
            let shape = layer.build(&mut self.state, &in_shapes)?;
            let output = layer.forward(&in_tensors)?;
            if ctx.logs_batches() {
                debug!(target: ctx.target.as_str(), layer = layer.name.as_str(), output_shape = shape.to_string().as_str(), params = layer.param_count(); "layer built");
            }
            shapes[id] = Some(shape);
            outputs[id] = Some(output);
        }
        outputs[output_index]
            .take()
            .ok_or_else(|| Error::lifecycle(format!("output layer of network '{}' produced no tensor", self.name)))
    }

    /// Forgets a failed build so the network is Defined and empty again.
    fn roll_back_build(&mut self) {
        for layer in self.layers.iter_mut() {
            *layer = layer.unbuilt();
        }
        self.state = GraphState::new();
        self.input = None;
        self.output = None;
    }

    pub fn output_shape(&self) -> Option<&TensorShape> {
        let output = self.output_index().ok()?;
        self.layers.get(output)?.output_shape()
    }

    /// Attaches loss, metrics and optimizer. Builds the network first when needed.
    pub fn compile(&mut self, loss: Loss, optimizer: Optimizer, metrics: &[MetricKind], ctx: &TrainingContext) -> Result<()> {
        if self.phase == Phase::Defined {
            self.build(ctx)?;
        }
        self.require_phase(Phase::Built, "compile")?;
        loss.validate()?;
        optimizer.validate()?;

        let output = self
            .output
            .clone()
            .ok_or_else(|| Error::lifecycle("the network has no output after its build"))?;
        let output_shape = self
            .output_shape()
            .cloned()
            .ok_or_else(|| Error::lifecycle("the output layer has no shape after its build"))?;
        let labels = Tensor::new_input(self.state.context(), "y", output_shape);
        let number_of_losses = labels.size();

        let mut loss_op = loss.apply(&output, &labels, Some(&number_of_losses))?;
        for (variable, regularizer) in self.state.regularizers().to_vec() {
            let weights = self.state.variable_tensor(&variable)?;
            loss_op = &loss_op + &regularizer.apply(&weights);
        }
        let prediction = if loss.kind.expects_logits() { output.softmax() } else { output };
        let metric_ops = metrics.iter().map(|m| m.apply(&prediction, &labels)).collect();
        let mut targets = optimizer.prepare_targets(&mut self.state, &loss_op)?;
        targets.extend(self.layers.iter().flat_map(|layer| layer.updates().iter().cloned()));

        if ctx.logs_epochs() {
            info!(target: ctx.target.as_str(), network = self.name.as_str(), loss = loss.kind.to_string().as_str(), optimizer = optimizer.name(), metrics = metrics.len(); "network compiled");
        }
        self.compiled = Some(Compiled {
            loss,
            optimizer,
            metrics: metrics.to_vec(),
            labels,
            loss_op,
            prediction,
            metric_ops,
            targets,
        });
        self.phase = Phase::Compiled;
        Ok(())
    }

    /// Runs every variable and optimizer initializer.
    pub fn init(&mut self) -> Result<()> {
        self.require_compiled("initialize")?;
        self.state.run_initializers()?;
        self.state.run_optimizer_initializers()?;
        Ok(())
    }

    pub fn loss(&self) -> Option<&Loss> {
        self.compiled.as_ref().map(|c| &c.loss)
    }

    pub fn optimizer(&self) -> Option<&Optimizer> {
        self.compiled.as_ref().map(|c| &c.optimizer)
    }

    pub fn metrics(&self) -> &[MetricKind] {
        self.compiled.as_ref().map(|c| c.metrics.as_slice()).unwrap_or(&[])
    }

    /// Current value of a model or optimizer variable.
    pub fn variable_value(&self, name: &str) -> Result<ndarray::ArrayD<f32>> {
        self.state.value(name)
    }

    /// Releases every variable value. The network cannot be used afterwards.
    pub fn close(&mut self) {
        self.state.clear_values();
        self.phase = Phase::Closed;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layers::{Activation, Concatenate, Dense, Input};
    use crate::losses::LossKind;

    pub(crate) fn mlp(name: &str) -> Network {
        Network::sequential(
            name,
            vec![
                Layer::new(Input::new(&[4])),
                Layer::new(Dense::new(8).with_activation(Activation::Relu)),
                Layer::new(Dense::new(3).with_activation(Activation::Linear)),
            ],
        )
        .unwrap()
    }

    pub(crate) fn compiled_mlp(name: &str) -> Network {
        let mut network = mlp(name);
        network
            .compile(Loss::new(LossKind::Mse), Optimizer::sgd(0.1).unwrap(), &[MetricKind::Mae], &TrainingContext::silent())
            .unwrap();
        network
    }

    #[test]
    fn test_generated_names_skip_explicit_ones() {
        let mut network = Network::sequential(
            "named",
            vec![
                Layer::new(Input::new(&[4])),
                Layer::new(Dense::new(8)).named("dense_2"),
                Layer::new(Dense::new(3)),
            ],
        )
        .unwrap();
        network.build(&TrainingContext::silent()).unwrap();
        let names: Vec<&str> = network.layers().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["input_1", "dense_2", "dense_3"]);
        assert!(network.state().variable_spec("dense_3_dense_kernel").is_some());
    }

    #[test]
    fn test_duplicate_explicit_names_are_rejected() {
        let mut network = Network::sequential(
            "dup",
            vec![
                Layer::new(Input::new(&[4])),
                Layer::new(Dense::new(8)).named("hidden"),
                Layer::new(Dense::new(3)).named("hidden"),
            ],
        )
        .unwrap();
        assert!(matches!(network.build(&TrainingContext::silent()), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_lifecycle_order_is_enforced() {
        let mut network = mlp("order");
        assert_eq!(network.phase(), Phase::Defined);
        assert!(matches!(network.init(), Err(Error::Lifecycle(_))));

        network.build(&TrainingContext::silent()).unwrap();
        assert_eq!(network.phase(), Phase::Built);
        assert!(matches!(network.build(&TrainingContext::silent()), Err(Error::Lifecycle(_))));

        network
            .compile(Loss::new(LossKind::Mse), Optimizer::adam(), &[], &TrainingContext::silent())
            .unwrap();
        assert_eq!(network.phase(), Phase::Compiled);
        network.init().unwrap();
        assert_eq!(network.phase(), Phase::Initialized);
        assert!(network.state().get_slot("dense_2_dense_kernel", "m").is_ok());

        network.close();
        assert_eq!(network.phase(), Phase::Closed);
        assert!(matches!(network.init(), Err(Error::Lifecycle(_))));
    }

    #[test]
    fn test_zero_width_layer_aborts_the_build() {
        let mut network =
            Network::sequential("bad", vec![Layer::new(Input::new(&[4])), Layer::new(Dense::new(0))]).unwrap();
        assert!(matches!(network.build(&TrainingContext::silent()), Err(Error::Shape { .. })));
        assert_eq!(network.phase(), Phase::Defined);
        assert!(network.layers().iter().all(|l| !l.is_built()));
        assert!(network.state().all_variables().is_empty());
        // a retry fails for the same reason instead of on the half-built input layer
        assert!(matches!(network.build(&TrainingContext::silent()), Err(Error::Shape { .. })));
    }

    #[test]
    fn test_failed_build_registers_no_variables() {
        let mut network = Network::sequential(
            "half",
            vec![Layer::new(Input::new(&[4])), Layer::new(Dense::new(3)), Layer::new(Dense::new(0))],
        )
        .unwrap();
        assert!(network.build(&TrainingContext::silent()).is_err());
        assert!(network.state().all_variables().is_empty());
        assert!(network.state().variable_spec("dense_2_dense_kernel").is_none());
        assert_eq!(network.layers()[1].param_count(), 0);
    }

    #[test]
    fn test_sequential_rejects_merge_layers_and_missing_input() {
        assert!(Network::sequential("x", vec![Layer::new(Dense::new(3))]).is_err());
        assert!(Network::sequential("x", vec![Layer::new(Input::new(&[2])), Layer::add()]).is_err());
    }

    #[test]
    fn test_functional_residual_block() {
        let mut network = Network::functional("residual");
        let input = network.add(Layer::new(Input::new(&[4])), &[]).unwrap();
        let a = network.add(Layer::new(Dense::new(4)), &[input]).unwrap();
        let b = network.add(Layer::new(Dense::new(4)), &[a]).unwrap();
        let sum = network.add(Layer::add(), &[a, b]).unwrap();
        let joined = network.add(Layer::new(Concatenate::default()), &[sum, input]).unwrap();
        network.add(Layer::new(Dense::new(2)), &[joined]).unwrap();
        assert!(network.add(Layer::new(Dense::new(2)), &[LayerId(42)]).is_err());

        network.build(&TrainingContext::silent()).unwrap();
        assert_eq!(network.output_shape().unwrap(), &TensorShape::with_unknown_batch(&[2]));
        assert_eq!(network.layers()[4].output_shape().unwrap(), &TensorShape::with_unknown_batch(&[8]));
        assert_eq!(network.inbound(3), vec![1, 2]);

        let rebuilt = Network::from_config(network.to_config()).unwrap();
        assert_eq!(rebuilt.inbound(4), vec![3, 0]);
        assert!(!rebuilt.layers()[1].is_built());
    }

    #[test]
    fn test_two_sinks_are_rejected() {
        let mut network = Network::functional("forked");
        let input = network.add(Layer::new(Input::new(&[4])), &[]).unwrap();
        network.add(Layer::new(Dense::new(2)), &[input]).unwrap();
        network.add(Layer::new(Dense::new(2)), &[input]).unwrap();
        assert!(matches!(network.build(&TrainingContext::silent()), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_regularized_loss_includes_the_penalty() {
        let mut network = Network::sequential(
            "reg",
            vec![
                Layer::new(Input::new(&[2])),
                Layer::new(
                    Dense::new(1)
                        .with_activation(Activation::Linear)
                        .with_kernel_regularizer(crate::regularizers::Regularizer::L2 { l2: 1.0 }),
                ),
            ],
        )
        .unwrap();
        network
            .compile(Loss::new(LossKind::Mse), Optimizer::sgd(0.0).unwrap(), &[], &TrainingContext::silent())
            .unwrap();
        assert_eq!(network.state().regularizers().len(), 1);
    }
}
