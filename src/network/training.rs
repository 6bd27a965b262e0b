//! The batched fit / evaluate / predict loops.

use super::{Compiled, Network};
use crate::asg::NodeId;
use crate::callbacks::{Callback, TrainingOutcome};
use crate::config::{FitConfig, TrainingContext};
use crate::data::{Batch, Dataset};
use crate::error::{Error, Result};
use crate::history::{BatchEvent, EpochEvent, History};
use crate::metrics::{MetricKind, WeightedMean};
use log::{debug, info, warn};
use ndarray::{Array2, ArrayD, Axis};
use std::collections::HashMap;

/// Loss and metrics over a whole dataset, weighted by actual batch sizes.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub loss: f64,
    pub metrics: Vec<(MetricKind, f64)>,
}

impl EvaluationResult {
    pub fn metric(&self, kind: MetricKind) -> Option<f64> {
        self.metrics.iter().find(|(k, _)| *k == kind).map(|(_, v)| *v)
    }
}

/// Node ids of one compiled network, detached from the borrow of the network.
struct StepPlan {
    features: NodeId,
    labels: NodeId,
    loss: NodeId,
    prediction: NodeId,
    metric_kinds: Vec<MetricKind>,
    metrics: Vec<NodeId>,
    targets: Vec<NodeId>,
}

impl StepPlan {
    fn new(features: NodeId, compiled: &Compiled) -> Self {
        Self {
            features,
            labels: compiled.labels.node_id,
            loss: compiled.loss_op.node_id,
            prediction: compiled.prediction.node_id,
            metric_kinds: compiled.metrics.clone(),
            metrics: compiled.metric_ops.iter().map(|t| t.node_id).collect(),
            targets: compiled.targets.iter().map(|t| t.node_id).collect(),
        }
    }

    fn fetches(&self) -> Vec<NodeId> {
        let mut fetches = Vec::with_capacity(1 + self.metrics.len());
        fetches.push(self.loss);
        fetches.extend_from_slice(&self.metrics);
        fetches
    }

    fn feeds(&self, batch: &Batch) -> HashMap<NodeId, ArrayD<f32>> {
        HashMap::from([(self.features, batch.features.clone()), (self.labels, batch.labels.clone())])
    }
}

/// Running weighted means of loss and metrics.
struct Aggregate {
    loss: WeightedMean,
    metrics: Vec<(MetricKind, WeightedMean)>,
}

impl Aggregate {
    fn new(kinds: &[MetricKind]) -> Self {
        Self { loss: WeightedMean::new(), metrics: kinds.iter().map(|k| (*k, WeightedMean::new())).collect() }
    }

    fn update(&mut self, event: &BatchEvent) {
        self.loss.update(event.loss, event.batch_size);
        for ((_, mean), (_, value)) in self.metrics.iter_mut().zip(&event.metrics) {
            mean.update(*value, event.batch_size);
        }
    }

    fn result(&self) -> EvaluationResult {
        EvaluationResult {
            loss: self.loss.compute(),
            metrics: self.metrics.iter().map(|(k, m)| (*k, m.compute())).collect(),
        }
    }
}

fn scalar(value: &ArrayD<f32>) -> f64 {
    value.sum() as f64
}

fn batch_event(plan: &StepPlan, epoch: usize, batch: usize, batch_size: usize, fetched: &[ArrayD<f32>]) -> BatchEvent {
    BatchEvent {
        epoch,
        batch,
        batch_size,
        loss: fetched.first().map(scalar).unwrap_or(f64::NAN),
        metrics: plan
            .metric_kinds
            .iter()
            .zip(fetched.iter().skip(1))
            .map(|(kind, value)| (*kind, scalar(value)))
            .collect(),
    }
}

impl Network {
    fn step_plan(&self, compiled: &Compiled) -> Result<StepPlan> {
        let features = self
            .input
            .as_ref()
            .ok_or_else(|| Error::lifecycle("the network has no input placeholder"))?
            .node_id;
        Ok(StepPlan::new(features, compiled))
    }

    fn check_dataset(&self, dataset: &Dataset, with_labels: bool) -> Result<()> {
        let input = self.input_shape()?;
        if input.known_tail().as_deref() != Some(dataset.feature_shape()) {
            return Err(Error::shape(
                &self.name,
                format!("the network expects examples of shape {}, the dataset has {:?}", input, dataset.feature_shape()),
            ));
        }
        if with_labels {
            let output = self.output_shape().ok_or_else(|| Error::lifecycle("the network is not built"))?;
            if output.known_tail().as_deref() != Some(dataset.label_shape()) {
                return Err(Error::shape(
                    &self.name,
                    format!("the network outputs {}, the dataset labels have shape {:?}", output, dataset.label_shape()),
                ));
            }
        }
        Ok(())
    }

    fn input_shape(&self) -> Result<crate::shape::TensorShape> {
        self.layers
            .iter()
            .find(|l| l.kind.is_input())
            .and_then(|l| l.output_shape().cloned())
            .ok_or_else(|| Error::lifecycle("the network is not built"))
    }

    /// Trains for `config.epochs` epochs and returns the events of the run.
    ///
    /// Callbacks are asked after every batch and every epoch whether to go on.
    /// Stopping early still calls `on_train_end` with the history gathered so far.
    pub fn fit(
        &mut self,
        train: &Dataset,
        validation: Option<&Dataset>,
        config: &FitConfig,
        callbacks: &mut [&mut dyn Callback],
        ctx: &TrainingContext,
    ) -> Result<History> {
        config.validate()?;
        self.require_compiled("fit")?;
        self.check_dataset(train, true)?;
        if let Some(validation) = validation {
            self.check_dataset(validation, true)?;
        }
        if config.init_weights {
            self.state.run_initializers()?;
        }
        if config.init_optimizer {
            self.state.run_optimizer_initializers()?;
        }
        let missing: Vec<String> = self
            .state
            .optimizer_variables()
            .iter()
            .filter(|v| !self.state.has_value(&v.name))
            .map(|v| v.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(Error::lifecycle(format!("optimizer state without values: {}", missing.join(", "))));
        }
        let plan = {
            let compiled = self.require_initialized("fit")?;
            self.step_plan(compiled)?
        };
        let fetches = plan.fetches();

        let mut history = History::new();
        for callback in callbacks.iter_mut() {
            callback.on_train_begin();
        }
        if ctx.logs_epochs() {
            info!(target: ctx.target.as_str(), network = self.name.as_str(), examples = train.len(), epochs = config.epochs, batch_size = config.batch_size; "training started");
        }

        'epochs: for epoch in 1..=config.epochs {
            for callback in callbacks.iter_mut() {
                callback.on_epoch_begin(epoch, &history);
            }
            let mut aggregate = Aggregate::new(&plan.metric_kinds);
            for (index, batch) in train.batch_iter(config.batch_size)?.enumerate() {
                let size = batch.len();
                for callback in callbacks.iter_mut() {
                    callback.on_train_batch_begin(index, size, &history);
                }
                let fetched = self.state.run(&plan.feeds(&batch), &fetches, &plan.targets, true)?;
                let event = batch_event(&plan, epoch, index, size, &fetched);
                if !event.loss.is_finite() {
                    warn!(target: ctx.target.as_str(), epoch = epoch, batch = index, loss = event.loss; "non-finite training loss");
                }
                if ctx.logs_batches() {
                    debug!(target: ctx.target.as_str(), epoch = epoch, batch = index, batch_size = size, loss = event.loss; "batch finished");
                }
                aggregate.update(&event);
                history.append_batch_event(event.clone());

                let mut outcome = TrainingOutcome::Continue;
                for callback in callbacks.iter_mut() {
                    outcome = outcome.merge(callback.on_train_batch_end(index, size, &event, &history));
                }
                if outcome.is_stop() {
                    break 'epochs;
                }
            }

            let train_result = aggregate.result();
            let validation_result = match validation {
                Some(dataset) => Some(self.evaluate_with(&plan, dataset, config.validation_batch_size, &mut [], None)?),
                None => None,
            };
            let event = EpochEvent {
                epoch,
                loss: train_result.loss,
                metrics: train_result.metrics,
                val_loss: validation_result.as_ref().map(|r| r.loss),
                val_metrics: validation_result.map(|r| r.metrics).unwrap_or_default(),
            };
            if ctx.logs_epochs() {
                match event.val_loss {
                    Some(val_loss) => {
                        info!(target: ctx.target.as_str(), epoch = epoch, loss = event.loss, val_loss = val_loss; "epoch finished")
                    }
                    None => info!(target: ctx.target.as_str(), epoch = epoch, loss = event.loss; "epoch finished"),
                }
            }
            history.append_epoch_event(event.clone());

            let mut outcome = TrainingOutcome::Continue;
            for callback in callbacks.iter_mut() {
                outcome = outcome.merge(callback.on_epoch_end(epoch, &event, &history));
            }
            if outcome.is_stop() {
                if ctx.logs_epochs() {
                    info!(target: ctx.target.as_str(), epoch = epoch; "training stopped by a callback");
                }
                break;
            }
        }

        for callback in callbacks.iter_mut() {
            callback.on_train_end(&history);
        }
        Ok(history)
    }

    /// Loss and metrics over `dataset` without updating any variable.
    pub fn evaluate(
        &mut self,
        dataset: &Dataset,
        batch_size: usize,
        callbacks: &mut [&mut dyn Callback],
        ctx: &TrainingContext,
    ) -> Result<EvaluationResult> {
        let plan = {
            let compiled = self.require_initialized("evaluate")?;
            self.step_plan(compiled)?
        };
        self.check_dataset(dataset, true)?;
        for callback in callbacks.iter_mut() {
            callback.on_test_begin();
        }
        let mut history = History::new();
        let result = self.evaluate_with(&plan, dataset, batch_size, callbacks, Some(&mut history))?;
        for callback in callbacks.iter_mut() {
            callback.on_test_end(&history);
        }
        if ctx.logs_epochs() {
            info!(target: ctx.target.as_str(), network = self.name.as_str(), examples = dataset.len(), loss = result.loss; "evaluation finished");
        }
        Ok(result)
    }

    /// Evaluation batches are recorded under epoch 0 when `history` is given.
    fn evaluate_with(
        &mut self,
        plan: &StepPlan,
        dataset: &Dataset,
        batch_size: usize,
        callbacks: &mut [&mut dyn Callback],
        mut history: Option<&mut History>,
    ) -> Result<EvaluationResult> {
        let fetches = plan.fetches();
        let mut aggregate = Aggregate::new(&plan.metric_kinds);
        let empty = History::new();
        for (index, batch) in dataset.batch_iter(batch_size)?.enumerate() {
            let size = batch.len();
            for callback in callbacks.iter_mut() {
                callback.on_test_batch_begin(index, size, history.as_deref().unwrap_or(&empty));
            }
            let fetched = self.state.run(&plan.feeds(&batch), &fetches, &[], false)?;
            let event = batch_event(plan, 0, index, size, &fetched);
            aggregate.update(&event);
            if let Some(history) = history.as_deref_mut() {
                history.append_batch_event(event.clone());
            }
            for callback in callbacks.iter_mut() {
                callback.on_test_batch_end(index, size, &event, history.as_deref().unwrap_or(&empty));
            }
        }
        Ok(aggregate.result())
    }

    /// Output rows for every example, flattened to `[N, outputs]`.
    ///
    /// The prediction op is the softmax of the logits when the loss works on logits.
    pub fn predict_softly_all(
        &mut self,
        dataset: &Dataset,
        batch_size: usize,
        callbacks: &mut [&mut dyn Callback],
        ctx: &TrainingContext,
    ) -> Result<Array2<f32>> {
        let plan = {
            let compiled = self.require_initialized("predict")?;
            self.step_plan(compiled)?
        };
        self.check_dataset(dataset, false)?;
        for callback in callbacks.iter_mut() {
            callback.on_predict_begin();
        }
        let history = History::new();
        let mut rows: Vec<f32> = Vec::new();
        let mut width = 0;
        for (index, batch) in dataset.batch_iter(batch_size)?.enumerate() {
            let size = batch.len();
            for callback in callbacks.iter_mut() {
                callback.on_predict_batch_begin(index, size, &history);
            }
            let feeds = HashMap::from([(plan.features, batch.features)]);
            let fetched = self.state.run(&feeds, &[plan.prediction], &[], false)?;
            let output = fetched.into_iter().next().ok_or_else(|| Error::lifecycle("prediction produced no output"))?;
            width = if size == 0 { 0 } else { output.len() / size };
            rows.extend(output.iter().copied());
            for callback in callbacks.iter_mut() {
                callback.on_predict_batch_end(index, size, &history);
            }
        }
        for callback in callbacks.iter_mut() {
            callback.on_predict_end(&history);
        }
        if ctx.logs_batches() {
            debug!(target: ctx.target.as_str(), examples = dataset.len(), outputs = width; "prediction finished");
        }
        Array2::from_shape_vec((dataset.len(), width), rows)
            .map_err(|e| Error::shape(&self.name, format!("cannot assemble predictions: {}", e)))
    }

    /// Arg-max class of every example.
    pub fn predict_all(
        &mut self,
        dataset: &Dataset,
        batch_size: usize,
        callbacks: &mut [&mut dyn Callback],
        ctx: &TrainingContext,
    ) -> Result<Vec<usize>> {
        let soft = self.predict_softly_all(dataset, batch_size, callbacks, ctx)?;
        Ok(soft.axis_iter(Axis(0)).map(|row| argmax(row.iter().copied())).collect())
    }

    /// Output vector of a single example shaped like one dataset row.
    pub fn predict_softly(&mut self, sample: &ArrayD<f32>) -> Result<Vec<f32>> {
        let plan = {
            let compiled = self.require_initialized("predict")?;
            self.step_plan(compiled)?
        };
        let input = self.input_shape()?;
        if input.known_tail().as_deref() != Some(sample.shape()) {
            return Err(Error::shape(
                &self.name,
                format!("the network expects an example of shape {}, got {:?}", input, sample.shape()),
            ));
        }
        let batch = sample.clone().insert_axis(Axis(0));
        let feeds = HashMap::from([(plan.features, batch)]);
        let fetched = self.state.run(&feeds, &[plan.prediction], &[], false)?;
        Ok(fetched.into_iter().next().map(|o| o.iter().copied().collect()).unwrap_or_default())
    }

    /// Arg-max class of a single example.
    pub fn predict(&mut self, sample: &ArrayD<f32>) -> Result<usize> {
        Ok(argmax(self.predict_softly(sample)?.into_iter()))
    }
}

/// Index of the first maximum.
fn argmax(values: impl Iterator<Item = f32>) -> usize {
    let mut best = (0, f32::NEG_INFINITY);
    for (i, v) in values.enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best.0
}

#[cfg(test)]
mod tests {
    use super::super::tests::compiled_mlp;
    use super::*;
    use crate::callbacks::EarlyStopping;
    use crate::history::Monitored;
    use ndarray::Array;

    fn regression_data(n: usize) -> Dataset {
        let features = Array::from_shape_fn((n, 4), |(i, j)| ((i + j) % 5) as f32 / 5.0).into_dyn();
        let labels = Array::from_shape_fn((n, 3), |(i, j)| ((i * 3 + j) % 4) as f32 / 4.0).into_dyn();
        Dataset::new(features, labels).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl Callback for Recorder {
        fn on_train_begin(&mut self) {
            self.calls.push("train_begin".into());
        }
        fn on_train_end(&mut self, history: &History) {
            self.calls.push(format!("train_end:{}", history.batch_events().len()));
        }
        fn on_epoch_begin(&mut self, epoch: usize, _history: &History) {
            self.calls.push(format!("epoch_begin:{}", epoch));
        }
        fn on_train_batch_end(&mut self, batch: usize, size: usize, _event: &BatchEvent, _history: &History) -> TrainingOutcome {
            self.calls.push(format!("batch:{}:{}", batch, size));
            TrainingOutcome::Continue
        }
        fn on_test_batch_end(&mut self, batch: usize, size: usize, event: &BatchEvent, _history: &History) {
            self.calls.push(format!("test:{}:{}:{}", batch, size, event.epoch));
        }
        fn on_predict_batch_end(&mut self, batch: usize, size: usize, _history: &History) {
            self.calls.push(format!("predict:{}:{}", batch, size));
        }
        fn on_predict_end(&mut self, history: &History) {
            self.calls.push(format!("predict_end:{}", history.batch_events().len()));
        }
    }

    /// Stops after a fixed number of batches.
    struct StopAfter(usize);

    impl Callback for StopAfter {
        fn on_train_batch_end(&mut self, _: usize, _: usize, _: &BatchEvent, history: &History) -> TrainingOutcome {
            if history.batch_events().len() >= self.0 {
                TrainingOutcome::Stop
            } else {
                TrainingOutcome::Continue
            }
        }
    }

    #[test]
    fn test_fit_before_compile_fails() {
        let mut network = super::super::tests::mlp("raw");
        let result = network.fit(&regression_data(4), None, &FitConfig::new(1, 2), &mut [], &TrainingContext::silent());
        assert!(matches!(result, Err(Error::Lifecycle(_))));
    }

    #[test]
    fn test_callback_order_and_partial_batches() {
        let mut network = compiled_mlp("calls");
        let mut recorder = Recorder::default();
        let history = network
            .fit(&regression_data(5), None, &FitConfig::new(2, 2), &mut [&mut recorder], &TrainingContext::silent())
            .unwrap();
        assert_eq!(
            recorder.calls,
            vec![
                "train_begin", "epoch_begin:1", "batch:0:2", "batch:1:2", "batch:2:1", "epoch_begin:2", "batch:0:2",
                "batch:1:2", "batch:2:1", "train_end:6",
            ]
        );
        assert_eq!(history.epoch_events().len(), 2);
        assert_eq!(history.batch_event(2, 2).unwrap().batch_size, 1);
    }

    #[test]
    fn test_stop_mid_epoch_still_ends_training() {
        let mut network = compiled_mlp("stop");
        let mut stop = StopAfter(2);
        let mut recorder = Recorder::default();
        let history = network
            .fit(
                &regression_data(6),
                None,
                &FitConfig::new(3, 2),
                &mut [&mut stop, &mut recorder],
                &TrainingContext::silent(),
            )
            .unwrap();
        assert_eq!(history.batch_events().len(), 2);
        assert!(history.epoch_events().is_empty());
        assert_eq!(recorder.calls.last().unwrap(), "train_end:2");
    }

    #[test]
    fn test_early_stopping_on_validation_loss() {
        let mut network = compiled_mlp("early");
        let data = regression_data(8);
        let mut early = EarlyStopping::new(Monitored::ValLoss, 0).with_baseline(-1.0);
        let history = network
            .fit(&data, Some(&data), &FitConfig::new(10, 4), &mut [&mut early], &TrainingContext::silent())
            .unwrap();
        // nothing beats a negative baseline, so the first epoch stops the run
        assert_eq!(history.epoch_events().len(), 1);
        assert!(history.last_epoch_event().unwrap().val_loss.is_some());
        assert_eq!(early.stopped_epoch(), Some(1));
    }

    #[test]
    fn test_evaluate_weights_by_actual_batch_size() {
        let mut network = compiled_mlp("eval");
        network.init().unwrap();
        let data = regression_data(5);
        let whole = network.evaluate(&data, 5, &mut [], &TrainingContext::silent()).unwrap();
        let mut recorder = Recorder::default();
        let batched = network.evaluate(&data, 2, &mut [&mut recorder], &TrainingContext::silent()).unwrap();
        assert!((whole.loss - batched.loss).abs() < 1e-5);
        assert!((whole.metric(MetricKind::Mae).unwrap() - batched.metric(MetricKind::Mae).unwrap()).abs() < 1e-5);
        assert_eq!(recorder.calls, vec!["test:0:2:0", "test:1:2:0", "test:2:1:0"]);
    }

    #[test]
    fn test_predictions_cover_every_example() {
        let mut network = compiled_mlp("predict");
        network.init().unwrap();
        let data = regression_data(7);
        let mut recorder = Recorder::default();
        let soft = network.predict_softly_all(&data, 3, &mut [&mut recorder], &TrainingContext::silent()).unwrap();
        assert_eq!(soft.dim(), (7, 3));
        assert_eq!(recorder.calls, vec!["predict:0:3", "predict:1:3", "predict:2:1", "predict_end:0"]);

        let classes = network.predict_all(&data, 4, &mut [], &TrainingContext::silent()).unwrap();
        assert_eq!(classes.len(), 7);
        let sample = data.features().index_axis(Axis(0), 6).to_owned();
        let single = network.predict_softly(&sample).unwrap();
        for (a, b) in single.iter().zip(soft.row(6).iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        assert_eq!(network.predict(&sample).unwrap(), classes[6]);
    }

    #[test]
    fn test_mismatched_dataset_shape_is_a_shape_error() {
        let mut network = compiled_mlp("shape");
        let data = Dataset::new(ArrayD::zeros(ndarray::IxDyn(&[2, 5])), ArrayD::zeros(ndarray::IxDyn(&[2, 3]))).unwrap();
        let result = network.fit(&data, None, &FitConfig::new(1, 2), &mut [], &TrainingContext::silent());
        assert!(matches!(result, Err(Error::Shape { .. })));
    }

    #[test]
    fn test_argmax_takes_the_first_maximum() {
        assert_eq!(argmax([0.1, 0.7, 0.7, 0.2].into_iter()), 1);
        assert_eq!(argmax(std::iter::empty()), 0);
    }
}
