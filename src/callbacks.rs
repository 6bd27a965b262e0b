//! Training-loop hooks.
//!
//! A [`Callback`] observes the loop through read-only views of the
//! [`History`]. It cannot touch the graph state; its only way to influence
//! training is the [`TrainingOutcome`] returned from the batch and epoch hooks,
//! which the loop driver checks after every batch and every epoch.

use crate::error::{Error, Result};
use crate::history::{BatchEvent, EpochEvent, History, Monitored};
use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainingOutcome {
    #[default]
    Continue,
    Stop,
}

impl TrainingOutcome {
    pub fn is_stop(self) -> bool {
        self == TrainingOutcome::Stop
    }

    /// `Stop` wins.
    pub fn merge(self, other: TrainingOutcome) -> TrainingOutcome {
        if self.is_stop() || other.is_stop() {
            TrainingOutcome::Stop
        } else {
            TrainingOutcome::Continue
        }
    }
}

/// Every hook has an empty default implementation.
#[allow(unused_variables)]
pub trait Callback {
    fn on_train_begin(&mut self) {}

    fn on_train_end(&mut self, history: &History) {}

    fn on_epoch_begin(&mut self, epoch: usize, history: &History) {}

    fn on_epoch_end(&mut self, epoch: usize, event: &EpochEvent, history: &History) -> TrainingOutcome {
        TrainingOutcome::Continue
    }

    fn on_train_batch_begin(&mut self, batch: usize, batch_size: usize, history: &History) {}

    fn on_train_batch_end(&mut self, batch: usize, batch_size: usize, event: &BatchEvent, history: &History) -> TrainingOutcome {
        TrainingOutcome::Continue
    }

    fn on_test_begin(&mut self) {}

    fn on_test_end(&mut self, history: &History) {}

    fn on_test_batch_begin(&mut self, batch: usize, batch_size: usize, history: &History) {}

    fn on_test_batch_end(&mut self, batch: usize, batch_size: usize, event: &BatchEvent, history: &History) {}

    fn on_predict_begin(&mut self) {}

    /// Prediction records no events, so the history seen here stays empty.
    fn on_predict_end(&mut self, history: &History) {}

    fn on_predict_batch_begin(&mut self, batch: usize, batch_size: usize, history: &History) {}

    fn on_predict_batch_end(&mut self, batch: usize, batch_size: usize, history: &History) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EarlyStoppingMode {
    Min,
    Max,
    /// Chosen from the monitored quantity.
    #[default]
    Auto,
}

/// Stops training once the monitored epoch quantity stops improving.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    monitor: Monitored,
    mode: EarlyStoppingMode,
    patience: usize,
    min_delta: f64,
    baseline: Option<f64>,
    wait: usize,
    best_value: Option<f64>,
    best_epoch: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(monitor: Monitored, patience: usize) -> Self {
        Self {
            monitor,
            mode: EarlyStoppingMode::Auto,
            patience,
            min_delta: 0.0,
            baseline: None,
            wait: 0,
            best_value: None,
            best_epoch: 0,
            stopped_epoch: None,
        }
    }

    pub fn with_mode(mut self, mode: EarlyStoppingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Result<Self> {
        if !(min_delta >= 0.0) {
            return Err(Error::config(format!("min_delta {} should be >= 0.0.", min_delta)));
        }
        self.min_delta = min_delta;
        Ok(self)
    }

    /// The monitored value must beat `baseline` for any epoch to count as an improvement.
    pub fn with_baseline(mut self, baseline: f64) -> Self {
        self.baseline = Some(baseline);
        self
    }

    fn maximize(&self) -> bool {
        match self.mode {
            EarlyStoppingMode::Min => false,
            EarlyStoppingMode::Max => true,
            EarlyStoppingMode::Auto => self.monitor.higher_is_better(),
        }
    }

    fn improves(&self, value: f64, reference: f64) -> bool {
        if self.maximize() {
            value - self.min_delta > reference
        } else {
            value + self.min_delta < reference
        }
    }

    /// Feeds one epoch value; `Stop` once `patience` epochs passed without improvement.
    pub fn check(&mut self, value: f64, epoch: usize) -> TrainingOutcome {
        let reference = self.best_value.or(self.baseline);
        let improved = match reference {
            Some(reference) => self.improves(value, reference),
            None => true,
        };
        if improved {
            self.best_value = Some(value);
            self.best_epoch = epoch;
            self.wait = 0;
            return TrainingOutcome::Continue;
        }
        self.wait += 1;
        if self.wait > self.patience {
            self.stopped_epoch = Some(epoch);
            return TrainingOutcome::Stop;
        }
        TrainingOutcome::Continue
    }

    pub fn best_value(&self) -> Option<f64> {
        self.best_value
    }

    pub fn best_epoch(&self) -> usize {
        self.best_epoch
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    pub fn reset(&mut self) {
        self.wait = 0;
        self.best_value = None;
        self.best_epoch = 0;
        self.stopped_epoch = None;
    }
}

impl Callback for EarlyStopping {
    fn on_train_begin(&mut self) {
        self.reset();
    }

    fn on_train_end(&mut self, _history: &History) {
        if let Some(epoch) = self.stopped_epoch {
            info!(epoch = epoch, best_epoch = self.best_epoch; "early stopping");
        }
    }

    fn on_epoch_end(&mut self, epoch: usize, event: &EpochEvent, _history: &History) -> TrainingOutcome {
        match event.value(self.monitor) {
            Some(value) => self.check(value, epoch),
            None => TrainingOutcome::Continue,
        }
    }
}
