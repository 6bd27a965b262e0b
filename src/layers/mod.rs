//! Layers: declarative building blocks of a network.
//!
//! A layer is described by its [`LayerKind`], a closed enum of plain
//! serializable configuration structs. Each kind provides three capabilities:
//!
//! - [`ShapeInferable`]: the output shape for given input shapes, a pure
//!   function of the configuration.
//! - [`VariableOwning`]: registration of its parameters in the
//!   [`GraphState`](crate::state::GraphState), once per build.
//! - [`ForwardBuilding`]: the graph pattern computing its output.
//!
//! [`Layer`] wraps a kind with a name and a trainable flag and remembers what
//! the build produced (shapes and variable handles).
//!
//! Available kinds:
//!
//! - `Input`: placeholder for the model input
//! - `Dense`: fully connected layer
//! - `Conv2D`: 2-D convolution over NHWC images
//! - `MaxPool2D`, `AvgPool2D`: 2-D pooling
//! - `Flatten`, `Reshape`: batch-preserving reshapes
//! - `Activation`: standalone activation function
//! - `Dropout`: training-only random masking
//! - `BatchNorm`: batch normalization with moving statistics
//! - `Add`, `Concatenate`: merge layers for functional models

pub mod activations;
pub mod basic;
pub mod conv;
pub mod merge;
pub mod normalization;
pub mod pooling;
pub mod reshaping;

pub use self::activations::Activation;
pub use self::basic::{ActivationLayer, Dense, Dropout, Input};
pub use self::conv::Conv2D;
pub use self::merge::{Add, Concatenate};
pub use self::normalization::BatchNorm;
pub use self::pooling::Pool2D;
pub use self::reshaping::{Flatten, Reshape};

use crate::error::{Error, Result};
use crate::shape::TensorShape;
use crate::state::GraphState;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Output shape computation.
pub trait ShapeInferable {
    /// `layer` only labels errors; the result never depends on it.
    fn compute_output_shape(&self, layer: &str, inputs: &[TensorShape]) -> Result<TensorShape>;
}

/// Parameter registration.
pub trait VariableOwning {
    /// Registers this layer's variables and their initializers. Returns the
    /// handles in role order (e.g. kernel, then bias).
    fn define_variables(
        &self,
        _layer: &str,
        _trainable: bool,
        _input: &TensorShape,
        _state: &mut GraphState,
    ) -> Result<Vec<Tensor>> {
        Ok(Vec::new())
    }

    fn param_count(&self, _input: &TensorShape) -> usize {
        0
    }
}

/// Forward graph construction.
pub trait ForwardBuilding {
    fn build_forward(&self, layer: &str, inputs: &[Tensor], variables: &[Tensor]) -> Result<Tensor>;

    /// The forward output together with the `Assign` ops a training step
    /// runs next to the optimizer updates.
    fn build_forward_with_updates(
        &self,
        layer: &str,
        _trainable: bool,
        inputs: &[Tensor],
        variables: &[Tensor],
    ) -> Result<(Tensor, Vec<Tensor>)> {
        Ok((self.build_forward(layer, inputs, variables)?, Vec::new()))
    }
}

/// The single input of a one-input layer.
pub(crate) fn single<'a, T>(layer: &str, inputs: &'a [T]) -> Result<&'a T> {
    match inputs {
        [only] => Ok(only),
        _ => Err(Error::shape(layer, format!("expected exactly one input, got {}", inputs.len()))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LayerKind {
    Input(Input),
    Dense(Dense),
    Conv2D(Conv2D),
    MaxPool2D(Pool2D),
    AvgPool2D(Pool2D),
    Flatten,
    Reshape(Reshape),
    Activation(ActivationLayer),
    Dropout(Dropout),
    BatchNorm(BatchNorm),
    Add,
    Concatenate(Concatenate),
}

impl LayerKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            LayerKind::Input(_) => "Input",
            LayerKind::Dense(_) => "Dense",
            LayerKind::Conv2D(_) => "Conv2D",
            LayerKind::MaxPool2D(_) => "MaxPool2D",
            LayerKind::AvgPool2D(_) => "AvgPool2D",
            LayerKind::Flatten => "Flatten",
            LayerKind::Reshape(_) => "Reshape",
            LayerKind::Activation(_) => "Activation",
            LayerKind::Dropout(_) => "Dropout",
            LayerKind::BatchNorm(_) => "BatchNorm",
            LayerKind::Add => "Add",
            LayerKind::Concatenate(_) => "Concatenate",
        }
    }

    /// Prefix of generated names, e.g. `dense` for `dense_3`.
    pub fn default_name_prefix(&self) -> String {
        self.type_name().to_lowercase()
    }

    /// Checks hyperparameters that do not depend on shapes.
    pub fn validate(&self, layer: &str) -> Result<()> {
        match self {
            LayerKind::Dense(dense) => dense.validate(),
            LayerKind::Conv2D(conv) => conv.validate(layer),
            LayerKind::MaxPool2D(pool) | LayerKind::AvgPool2D(pool) => pool.validate(layer),
            LayerKind::Dropout(dropout) => dropout.validate(),
            LayerKind::BatchNorm(norm) => norm.validate(layer),
            _ => Ok(()),
        }
    }

    pub fn is_input(&self) -> bool {
        matches!(self, LayerKind::Input(_))
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, LayerKind::Add | LayerKind::Concatenate(_))
    }
}

impl ShapeInferable for LayerKind {
    fn compute_output_shape(&self, layer: &str, inputs: &[TensorShape]) -> Result<TensorShape> {
        match self {
            LayerKind::Input(input) => input.compute_output_shape(layer, inputs),
            LayerKind::Dense(dense) => dense.compute_output_shape(layer, inputs),
            LayerKind::Conv2D(conv) => conv.compute_output_shape(layer, inputs),
            LayerKind::MaxPool2D(pool) | LayerKind::AvgPool2D(pool) => pool.compute_output_shape(layer, inputs),
            LayerKind::Flatten => Flatten.compute_output_shape(layer, inputs),
            LayerKind::Reshape(reshape) => reshape.compute_output_shape(layer, inputs),
            LayerKind::Activation(activation) => activation.compute_output_shape(layer, inputs),
            LayerKind::Dropout(dropout) => dropout.compute_output_shape(layer, inputs),
            LayerKind::BatchNorm(norm) => norm.compute_output_shape(layer, inputs),
            LayerKind::Add => Add.compute_output_shape(layer, inputs),
            LayerKind::Concatenate(concat) => concat.compute_output_shape(layer, inputs),
        }
    }
}

impl VariableOwning for LayerKind {
    fn define_variables(
        &self,
        layer: &str,
        trainable: bool,
        input: &TensorShape,
        state: &mut GraphState,
    ) -> Result<Vec<Tensor>> {
        match self {
            LayerKind::Dense(dense) => dense.define_variables(layer, trainable, input, state),
            LayerKind::Conv2D(conv) => conv.define_variables(layer, trainable, input, state),
            LayerKind::BatchNorm(norm) => norm.define_variables(layer, trainable, input, state),
            _ => Ok(Vec::new()),
        }
    }

    fn param_count(&self, input: &TensorShape) -> usize {
        match self {
            LayerKind::Dense(dense) => dense.param_count(input),
            LayerKind::Conv2D(conv) => conv.param_count(input),
            LayerKind::BatchNorm(norm) => norm.param_count(input),
            _ => 0,
        }
    }
}

impl ForwardBuilding for LayerKind {
    fn build_forward(&self, layer: &str, inputs: &[Tensor], variables: &[Tensor]) -> Result<Tensor> {
        match self {
            LayerKind::Input(input) => input.build_forward(layer, inputs, variables),
            LayerKind::Dense(dense) => dense.build_forward(layer, inputs, variables),
            LayerKind::Conv2D(conv) => conv.build_forward(layer, inputs, variables),
            LayerKind::MaxPool2D(pool) => pool.build_max(layer, inputs),
            LayerKind::AvgPool2D(pool) => pool.build_avg(layer, inputs),
            LayerKind::Flatten => Flatten.build_forward(layer, inputs, variables),
            LayerKind::Reshape(reshape) => reshape.build_forward(layer, inputs, variables),
            LayerKind::Activation(activation) => activation.build_forward(layer, inputs, variables),
            LayerKind::Dropout(dropout) => dropout.build_forward(layer, inputs, variables),
            LayerKind::BatchNorm(norm) => norm.build_forward(layer, inputs, variables),
            LayerKind::Add => Add.build_forward(layer, inputs, variables),
            LayerKind::Concatenate(concat) => concat.build_forward(layer, inputs, variables),
        }
    }

    fn build_forward_with_updates(
        &self,
        layer: &str,
        trainable: bool,
        inputs: &[Tensor],
        variables: &[Tensor],
    ) -> Result<(Tensor, Vec<Tensor>)> {
        match self {
            LayerKind::BatchNorm(norm) => norm.build_training_forward(layer, trainable, inputs, variables),
            _ => Ok((self.build_forward(layer, inputs, variables)?, Vec::new())),
        }
    }
}

macro_rules! impl_into_kind {
    ($($config:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$config> for LayerKind {
                fn from(config: $config) -> Self {
                    LayerKind::$variant(config)
                }
            }
        )*
    };
}

impl_into_kind!(
    Input => Input,
    Dense => Dense,
    Conv2D => Conv2D,
    Reshape => Reshape,
    ActivationLayer => Activation,
    Dropout => Dropout,
    BatchNorm => BatchNorm,
    Concatenate => Concatenate,
);

/// What a build produced for one layer.
#[derive(Debug, Clone)]
pub struct BuiltLayer {
    pub input_shapes: Vec<TensorShape>,
    pub output_shape: TensorShape,
    pub variables: Vec<Tensor>,
    pub variable_names: Vec<String>,
    /// `Assign` ops of training steps, filled by the forward pass.
    pub updates: Vec<Tensor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    /// Empty until the network assigns a generated name.
    pub name: String,
    pub trainable: bool,
    pub kind: LayerKind,
    #[serde(skip)]
    built: Option<BuiltLayer>,
}

impl Layer {
    pub fn new(kind: impl Into<LayerKind>) -> Self {
        Self {
            name: String::new(),
            trainable: true,
            kind: kind.into(),
            built: None,
        }
    }

    pub fn max_pool(pool: Pool2D) -> Self {
        Self::new(LayerKind::MaxPool2D(pool))
    }

    pub fn avg_pool(pool: Pool2D) -> Self {
        Self::new(LayerKind::AvgPool2D(pool))
    }

    pub fn flatten() -> Self {
        Self::new(LayerKind::Flatten)
    }

    pub fn add() -> Self {
        Self::new(LayerKind::Add)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Marks the layer's variables as non-trainable.
    pub fn frozen(mut self) -> Self {
        self.trainable = false;
        self
    }

    pub fn with_trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// The same configuration, without anything a build produced.
    pub fn unbuilt(&self) -> Layer {
        Layer {
            name: self.name.clone(),
            trainable: self.trainable,
            kind: self.kind.clone(),
            built: None,
        }
    }

    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    pub fn built(&self) -> Option<&BuiltLayer> {
        self.built.as_ref()
    }

    pub fn output_shape(&self) -> Option<&TensorShape> {
        self.built.as_ref().map(|b| &b.output_shape)
    }

    pub fn updates(&self) -> &[Tensor] {
        self.built.as_ref().map(|b| b.updates.as_slice()).unwrap_or(&[])
    }

    pub fn variable_names(&self) -> &[String] {
        self.built.as_ref().map(|b| b.variable_names.as_slice()).unwrap_or(&[])
    }

    /// Number of scalar parameters; zero before the build.
    pub fn param_count(&self) -> usize {
        match &self.built {
            Some(built) => built
                .input_shapes
                .first()
                .map(|input| self.kind.param_count(input))
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Infers the output shape, checks it and registers the layer's variables.
    /// A layer is built at most once.
    pub fn build(&mut self, state: &mut GraphState, input_shapes: &[TensorShape]) -> Result<TensorShape> {
        if self.built.is_some() {
            return Err(Error::lifecycle(format!("layer '{}' is built already", self.name)));
        }
        self.kind.validate(&self.name)?;
        let output_shape = self.kind.compute_output_shape(&self.name, input_shapes)?;
        if !output_shape.has_positive_tail() {
            return Err(Error::shape(
                &self.name,
                format!(
                    "output shape {} has a non-positive or unresolved non-batch dimension",
                    output_shape
                ),
            ));
        }
        let variables = match input_shapes.first() {
            Some(input) => self.kind.define_variables(&self.name, self.trainable, input, state)?,
            None => Vec::new(),
        };
        let variable_names = variables
            .iter()
            .map(|t| {
                let graph = t.context.borrow();
                graph
                    .main_graph()
                    .get_node(t.node_id)
                    .ok()
                    .and_then(|node| node.name.clone())
                    .unwrap_or_default()
            })
            .collect();
        self.built = Some(BuiltLayer {
            input_shapes: input_shapes.to_vec(),
            output_shape: output_shape.clone(),
            variables,
            variable_names,
            updates: Vec::new(),
        });
        Ok(output_shape)
    }

    /// Builds the output graph and remembers the training updates it needs.
    pub fn forward(&mut self, inputs: &[Tensor]) -> Result<Tensor> {
        let built = self
            .built
            .as_mut()
            .ok_or_else(|| Error::lifecycle(format!("layer '{}' must be built before its forward pass", self.name)))?;
        let (output, updates) =
            self.kind
                .build_forward_with_updates(&self.name, self.trainable, inputs, &built.variables)?;
        built.updates = updates;
        // Downstream layers (e.g. Flatten) read the static shape off the node.
        output
            .context
            .borrow_mut()
            .main_graph_mut()
            .get_node_mut(output.node_id)?
            .shape = Some(built.output_shape.clone());
        Ok(output)
    }
}
