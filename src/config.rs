//! Run configuration passed explicitly into the network lifecycle calls.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Which events a run reports through the `log` facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Verbosity {
    Silent,
    /// Lifecycle transitions and one line per epoch.
    #[default]
    Epochs,
    /// Also one line per batch.
    Batches,
}

/// Replaces a process-wide logging level: every `build`/`compile`/`fit`/
/// `evaluate`/`predict*` call receives one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingContext {
    pub verbosity: Verbosity,
    /// `log` target of every event of the run.
    pub target: String,
}

impl Default for TrainingContext {
    fn default() -> Self {
        Self { verbosity: Verbosity::Epochs, target: "graphtrain".to_string() }
    }
}

impl TrainingContext {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity, ..Self::default() }
    }

    pub fn silent() -> Self {
        Self::new(Verbosity::Silent)
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = target.to_string();
        self
    }

    pub fn logs_epochs(&self) -> bool {
        self.verbosity >= Verbosity::Epochs
    }

    pub fn logs_batches(&self) -> bool {
        self.verbosity >= Verbosity::Batches
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub validation_batch_size: usize,
    /// Run the variable initializers before the first epoch.
    pub init_weights: bool,
    /// Run the optimizer slot initializers before the first epoch.
    pub init_optimizer: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self { epochs: 5, batch_size: 32, validation_batch_size: 256, init_weights: true, init_optimizer: true }
    }
}

impl FitConfig {
    pub fn new(epochs: usize, batch_size: usize) -> Self {
        Self { epochs, batch_size, ..Self::default() }
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_validation_batch_size(mut self, batch_size: usize) -> Self {
        self.validation_batch_size = batch_size;
        self
    }

    /// `false` keeps values loaded or trained earlier, e.g. for transfer learning.
    pub fn with_init_weights(mut self, init: bool) -> Self {
        self.init_weights = init;
        self
    }

    pub fn with_init_optimizer(mut self, init: bool) -> Self {
        self.init_optimizer = init;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(Error::config("number of epochs must be positive"));
        }
        if self.batch_size == 0 || self.validation_batch_size == 0 {
            return Err(Error::config("batch size must be positive"));
        }
        Ok(())
    }
}

/// Layout of a saved model directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SavingFormat {
    /// `graph.json` with the graph definition and one text file per variable.
    GraphCustomVariables,
    /// `modelConfig.json` with the layer configuration and one text file per variable.
    #[default]
    JsonConfigCustomVariables,
    /// `modelConfig.json` and all variables in `weights.safetensors`.
    JsonConfigSafeTensors,
}

/// What to do when the target directory already has files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WritingMode {
    #[default]
    FailIfExists,
    /// Empty the directory first.
    Override,
    /// Write next to the existing files, replacing those with the same name.
    Append,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_config_builders_and_validation() {
        let config = FitConfig::new(3, 2).with_init_optimizer(false).with_validation_batch_size(4);
        assert_eq!(config.epochs, 3);
        assert!(config.init_weights);
        assert!(!config.init_optimizer);
        assert!(config.validate().is_ok());
        assert!(FitConfig::new(0, 2).validate().is_err());
        assert!(FitConfig::new(1, 0).validate().is_err());
    }

    #[test]
    fn test_verbosity_levels_are_ordered() {
        assert!(!TrainingContext::silent().logs_epochs());
        assert!(TrainingContext::default().logs_epochs());
        assert!(!TrainingContext::default().logs_batches());
        assert!(TrainingContext::new(Verbosity::Batches).with_target("demo").logs_batches());
    }
}
