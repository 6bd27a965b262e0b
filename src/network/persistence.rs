//! Saving, loading and copying networks.
//!
//! Loading stages every value before touching the graph state, so a missing
//! or truncated file leaves the network exactly as it was.

use super::{ModelConfig, Network, Phase};
use crate::config::{SavingFormat, TrainingContext, WritingMode};
use crate::error::{Error, Result};
use crate::serialization::checkpoint::{self, CheckpointError, CheckpointMetadata, GRAPH_FILE, MODEL_CONFIG_FILE, WEIGHTS_FILE};
use crate::serialization::safetensors_io::{load_safetensors, save_safetensors};
use crate::state::OPTIMIZER_PREFIX;
use log::{debug, info};
use ndarray::ArrayD;
use std::collections::BTreeMap;
use std::path::Path;

impl Network {
    /// Writes the network to `dir` in `format`.
    ///
    /// With `save_optimizer_state` the optimizer variables are written next to
    /// the model variables; they must have been initialized.
    pub fn save(
        &self,
        dir: &Path,
        format: SavingFormat,
        mode: WritingMode,
        save_optimizer_state: bool,
        ctx: &TrainingContext,
    ) -> Result<()> {
        let compiled = self.require_initialized("save")?;
        if save_optimizer_state {
            let missing: Vec<&str> = self
                .state
                .optimizer_variables()
                .iter()
                .filter(|v| !self.state.has_value(&v.name))
                .map(|v| v.name.as_str())
                .collect();
            if !missing.is_empty() {
                return Err(Error::lifecycle(format!(
                    "optimizer state of network '{}' is not initialized: {}",
                    self.name,
                    missing.join(", ")
                )));
            }
        }

        let mut variables: Vec<(String, ArrayD<f32>)> = Vec::new();
        for spec in self.state.all_variables() {
            variables.push((spec.name.clone(), self.state.value(&spec.name)?));
        }
        if save_optimizer_state {
            for spec in self.state.optimizer_variables() {
                variables.push((spec.name.clone(), self.state.value(&spec.name)?));
            }
        }

        checkpoint::prepare_directory(dir, mode)?;
        let metadata = CheckpointMetadata::new(&self.name, format)
            .with_optimizer(compiled.optimizer.name())
            .with_optimizer_state_saved(save_optimizer_state);
        checkpoint::write_metadata(dir, &metadata)?;

        match format {
            SavingFormat::GraphCustomVariables => {
                let context = self.state.context().borrow();
                checkpoint::write_json(&dir.join(GRAPH_FILE), context.main_graph())?;
            }
            SavingFormat::JsonConfigCustomVariables | SavingFormat::JsonConfigSafeTensors => {
                checkpoint::write_json(&dir.join(MODEL_CONFIG_FILE), &self.to_config())?;
            }
        }
        match format {
            SavingFormat::JsonConfigSafeTensors => {
                let tensors: BTreeMap<String, ArrayD<f32>> = variables.into_iter().collect();
                save_safetensors(dir.join(WEIGHTS_FILE), &tensors).map_err(CheckpointError::from)?;
            }
            _ => {
                checkpoint::write_variables_text(dir, variables.iter().map(|(name, value)| (name.as_str(), value)))?;
            }
        }
        if ctx.logs_epochs() {
            info!(
                target: ctx.target.as_str(),
                network = self.name.as_str(), dir = dir.display().to_string().as_str(), optimizer_state = save_optimizer_state;
                "network saved"
            );
        }
        Ok(())
    }

    /// Slot of a variable that has no slots because it is frozen.
    fn is_frozen_slot(&self, name: &str) -> bool {
        name.strip_prefix(OPTIMIZER_PREFIX)
            .and_then(|rest| rest.rsplit_once('-'))
            .and_then(|(variable, _)| self.state.variable_spec(variable))
            .map(|spec| !spec.trainable && !self.state.is_optimizer_variable(name))
            .unwrap_or(false)
    }

    /// Whether `name` from a checkpoint is restored; unknown names are errors.
    fn should_load(&self, name: &str, load_optimizer_state: bool) -> Result<bool> {
        if name.starts_with(OPTIMIZER_PREFIX) && (!load_optimizer_state || self.is_frozen_slot(name)) {
            return Ok(false);
        }
        if self.state.variable_spec(name).is_none() {
            return Err(Error::UnknownVariable(name.to_string()));
        }
        Ok(true)
    }

    /// Restores variable values written by [`Network::save`].
    ///
    /// The network must be built, and compiled when `load_optimizer_state` is set.
    pub fn load_weights(&mut self, dir: &Path, load_optimizer_state: bool, ctx: &TrainingContext) -> Result<()> {
        match self.phase {
            Phase::Built if !load_optimizer_state => {}
            Phase::Compiled => {}
            _ => {
                return Err(Error::lifecycle(format!(
                    "cannot load weights into network '{}': it is {}, expected {}",
                    self.name,
                    self.phase(),
                    if load_optimizer_state { Phase::Compiled } else { Phase::Built }
                )))
            }
        }
        let metadata = checkpoint::read_metadata(dir)?;

        let mut staged: Vec<(String, ArrayD<f32>)> = Vec::new();
        match metadata.saving_format {
            SavingFormat::JsonConfigSafeTensors => {
                for (name, value) in load_safetensors(dir.join(WEIGHTS_FILE)).map_err(CheckpointError::from)? {
                    if self.should_load(&name, load_optimizer_state)? {
                        staged.push((name, value));
                    }
                }
            }
            SavingFormat::GraphCustomVariables | SavingFormat::JsonConfigCustomVariables => {
                for name in checkpoint::read_variable_names(dir)? {
                    if !self.should_load(&name, load_optimizer_state)? {
                        continue;
                    }
                    let shape = self
                        .state
                        .variable_spec(&name)
                        .map(|spec| spec.shape.clone())
                        .ok_or_else(|| Error::UnknownVariable(name.clone()))?;
                    let value = checkpoint::read_variable_text(dir, &name, &shape)?;
                    staged.push((name, value));
                }
            }
        }
        for (name, value) in &staged {
            let expected = self.state.variable_spec(name).map(|spec| spec.shape.as_slice()).unwrap_or(&[]);
            if value.shape() != expected {
                return Err(Error::shape(
                    name,
                    format!("checkpoint value has shape {:?}, the variable {:?}", value.shape(), expected),
                ));
            }
        }

        let count = staged.len();
        for (name, value) in staged {
            if ctx.logs_batches() {
                debug!(target: ctx.target.as_str(), variable = name.as_str(); "variable restored");
            }
            self.state.set_value(&name, value)?;
        }
        if ctx.logs_epochs() {
            info!(
                target: ctx.target.as_str(),
                network = self.name.as_str(), variables = count, optimizer_state = load_optimizer_state;
                "weights loaded"
            );
        }
        Ok(())
    }

    /// An uncompiled network with the architecture saved in `dir`.
    pub fn load_model_configuration(dir: &Path) -> Result<Network> {
        checkpoint::require_directory(dir)?;
        let config: ModelConfig = checkpoint::read_json(&dir.join(MODEL_CONFIG_FILE))?;
        Network::from_config(config)
    }

    /// A compiled twin of this network with its own graph state.
    ///
    /// Values are deep-copied; the two networks train independently.
    pub fn copy(&self, name: &str, copy_optimizer_state: bool, copy_weights: bool, ctx: &TrainingContext) -> Result<Network> {
        let compiled = self.require_compiled("copy")?;
        let mut config = self.to_config();
        config.name = name.to_string();
        let mut copy = Network::from_config(config)?;
        copy.compile(compiled.loss.clone(), compiled.optimizer.clone(), &compiled.metrics, ctx)?;

        if copy_weights {
            for spec in self.state.all_variables() {
                if self.state.has_value(&spec.name) {
                    copy.state.set_value(&spec.name, self.state.value(&spec.name)?)?;
                }
            }
        }
        if copy_optimizer_state {
            for spec in self.state.optimizer_variables() {
                if self.state.has_value(&spec.name) {
                    copy.state.set_value(&spec.name, self.state.value(&spec.name)?)?;
                }
            }
        }
        Ok(copy)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{compiled_mlp, mlp};
    use super::*;
    use crate::config::Verbosity;
    use crate::losses::{Loss, LossKind};
    use crate::metrics::MetricKind;
    use crate::optimizers::Optimizer;
    use crate::serialization::checkpoint::VARIABLE_NAMES_FILE;
    use std::fs;

    fn trained_adam(name: &str) -> Network {
        let mut network = mlp(name);
        network
            .compile(Loss::new(LossKind::Mse), Optimizer::adam(), &[MetricKind::Mae], &TrainingContext::silent())
            .unwrap();
        network.init().unwrap();
        network
    }

    fn assert_same_values(a: &Network, b: &Network, names: &[String]) {
        for name in names {
            assert_eq!(a.variable_value(name).unwrap(), b.variable_value(name).unwrap(), "{}", name);
        }
    }

    fn model_names(network: &Network) -> Vec<String> {
        network.state().all_variables().iter().map(|v| v.name.clone()).collect()
    }

    #[test]
    fn test_round_trip_in_every_format() {
        for format in [
            SavingFormat::GraphCustomVariables,
            SavingFormat::JsonConfigCustomVariables,
            SavingFormat::JsonConfigSafeTensors,
        ] {
            let dir = tempfile::tempdir().unwrap();
            let source = trained_adam("source");
            source.save(dir.path(), format, WritingMode::Override, true, &TrainingContext::silent()).unwrap();

            let mut target = trained_adam("target");
            target.load_weights(dir.path(), true, &TrainingContext::silent()).unwrap();
            assert_same_values(&source, &target, &model_names(&source));
            let optimizer: Vec<String> = source.state().optimizer_variables().iter().map(|v| v.name.clone()).collect();
            assert_same_values(&source, &target, &optimizer);
        }
    }

    #[test]
    fn test_optimizer_state_is_skipped_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let source = trained_adam("source");
        source
            .save(dir.path(), SavingFormat::JsonConfigCustomVariables, WritingMode::FailIfExists, true, &TrainingContext::silent())
            .unwrap();
        let manifest = fs::read_to_string(dir.path().join(VARIABLE_NAMES_FILE)).unwrap();
        assert!(manifest.lines().any(|l| l == "optimizer_beta1_power"));

        let mut target = mlp("fresh");
        target.build(&TrainingContext::silent()).unwrap();
        target.load_weights(dir.path(), false, &TrainingContext::silent()).unwrap();
        assert_same_values(&source, &target, &model_names(&source));
        assert!(matches!(target.load_weights(dir.path(), true, &TrainingContext::silent()), Err(Error::Lifecycle(_))));
    }

    #[test]
    fn test_truncated_file_leaves_values_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let source = trained_adam("source");
        source
            .save(dir.path(), SavingFormat::JsonConfigCustomVariables, WritingMode::Override, false, &TrainingContext::silent())
            .unwrap();
        fs::write(dir.path().join("dense_3_dense_bias.txt"), "0.5").unwrap();

        let mut target = trained_adam("target");
        let before = target.variable_value("dense_2_dense_kernel").unwrap();
        let result = target.load_weights(dir.path(), false, &TrainingContext::silent());
        assert!(matches!(result, Err(Error::Checkpoint(CheckpointError::ValueCount { .. }))));
        assert_eq!(target.variable_value("dense_2_dense_kernel").unwrap(), before);
    }

    #[test]
    fn test_save_requires_values_and_respects_writing_mode() {
        let dir = tempfile::tempdir().unwrap();
        let uninitialized = compiled_mlp("empty");
        assert!(matches!(
            uninitialized.save(dir.path(), SavingFormat::JsonConfigSafeTensors, WritingMode::Override, false, &TrainingContext::silent()),
            Err(Error::Lifecycle(_))
        ));

        let network = trained_adam("saved");
        network.save(dir.path(), SavingFormat::JsonConfigSafeTensors, WritingMode::Override, false, &TrainingContext::silent()).unwrap();
        assert!(matches!(
            network.save(dir.path(), SavingFormat::JsonConfigSafeTensors, WritingMode::FailIfExists, false, &TrainingContext::silent()),
            Err(Error::Checkpoint(CheckpointError::DirectoryNotEmpty(_)))
        ));
    }

    /// Keeps the messages logged under the targets used by these tests.
    struct CapturedLog(std::sync::Mutex<Vec<String>>);

    impl log::Log for CapturedLog {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.target().starts_with("checkpoint_log")
        }

        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                if let Ok(mut lines) = self.0.lock() {
                    lines.push(format!("{}:{}", record.target(), record.args()));
                }
            }
        }

        fn flush(&self) {}
    }

    static CAPTURED: CapturedLog = CapturedLog(std::sync::Mutex::new(Vec::new()));

    #[test]
    fn test_checkpoint_logging_follows_the_context() {
        let _ = log::set_logger(&CAPTURED);
        log::set_max_level(log::LevelFilter::Debug);
        let network = trained_adam("logged");
        let quiet = TrainingContext::silent().with_target("checkpoint_log_quiet");
        let loud = TrainingContext::new(Verbosity::Epochs).with_target("checkpoint_log_loud");

        for (ctx, subdir) in [(&quiet, "quiet"), (&loud, "loud")] {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join(subdir);
            network.save(&path, SavingFormat::JsonConfigSafeTensors, WritingMode::Override, false, ctx).unwrap();
            let mut target = trained_adam("reader");
            target.load_weights(&path, false, ctx).unwrap();
        }

        let lines = CAPTURED.0.lock().unwrap().clone();
        assert!(lines.iter().all(|l| !l.starts_with("checkpoint_log_quiet")), "{:?}", lines);
        let loud: Vec<&String> = lines.iter().filter(|l| l.starts_with("checkpoint_log_loud")).collect();
        assert_eq!(loud, vec!["checkpoint_log_loud:network saved", "checkpoint_log_loud:weights loaded"]);
    }

    #[test]
    fn test_missing_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut network = trained_adam("net");
        assert!(matches!(
            network.load_weights(&dir.path().join("nothing"), false, &TrainingContext::silent()),
            Err(Error::Checkpoint(CheckpointError::DirectoryNotFound(_)))
        ));
    }

    #[test]
    fn test_configuration_round_trip_rebuilds_the_architecture() {
        let dir = tempfile::tempdir().unwrap();
        let source = trained_adam("arch");
        source
            .save(dir.path(), SavingFormat::JsonConfigCustomVariables, WritingMode::Override, false, &TrainingContext::silent())
            .unwrap();

        let mut loaded = Network::load_model_configuration(dir.path()).unwrap();
        assert_eq!(loaded.name(), "arch");
        assert_eq!(loaded.phase(), Phase::Defined);
        loaded
            .compile(Loss::new(LossKind::Mse), Optimizer::adam(), &[], &TrainingContext::silent())
            .unwrap();
        assert_eq!(model_names(&loaded), model_names(&source));
        loaded.load_weights(dir.path(), false, &TrainingContext::silent()).unwrap();
        assert_same_values(&source, &loaded, &model_names(&source));
    }

    #[test]
    fn test_copy_is_deep() {
        let mut source = trained_adam("source");
        let copy = source.copy("twin", true, true, &TrainingContext::silent()).unwrap();
        assert_eq!(copy.name(), "twin");
        assert_same_values(&source, &copy, &model_names(&source));
        assert_eq!(
            copy.variable_value("optimizer_beta1_power").unwrap(),
            source.variable_value("optimizer_beta1_power").unwrap()
        );

        let before = copy.variable_value("dense_3_dense_kernel").unwrap();
        source.state.set_value("dense_3_dense_kernel", ArrayD::zeros(before.raw_dim())).unwrap();
        assert_eq!(copy.variable_value("dense_3_dense_kernel").unwrap(), before);

        let empty = source.copy("bare", false, false, &TrainingContext::silent()).unwrap();
        assert!(!empty.state().has_value("dense_3_dense_kernel"));
    }
}
