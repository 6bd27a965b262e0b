//! Append-only log of training and evaluation events.
//!
//! Events are stored in the order they were produced and additionally indexed
//! by `(epoch, batch)` and by epoch, so the latest or a specific event is
//! found in logarithmic time. Epochs are 1-based; batch events of a
//! standalone evaluation use epoch 0.

use crate::metrics::MetricKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Quantity of an epoch event, selected by name in early stopping and plots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Monitored {
    Loss,
    ValLoss,
    Metric(MetricKind),
    ValMetric(MetricKind),
}

impl Monitored {
    /// Losses are minimized; metrics follow [`MetricKind::higher_is_better`].
    pub fn higher_is_better(&self) -> bool {
        match self {
            Monitored::Loss | Monitored::ValLoss => false,
            Monitored::Metric(kind) | Monitored::ValMetric(kind) => kind.higher_is_better(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEvent {
    pub epoch: usize,
    pub batch: usize,
    /// Number of examples actually in the batch; the last one may be short.
    pub batch_size: usize,
    pub loss: f64,
    pub metrics: Vec<(MetricKind, f64)>,
}

impl BatchEvent {
    pub fn metric(&self, kind: MetricKind) -> Option<f64> {
        lookup(&self.metrics, kind)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochEvent {
    pub epoch: usize,
    pub loss: f64,
    pub metrics: Vec<(MetricKind, f64)>,
    pub val_loss: Option<f64>,
    pub val_metrics: Vec<(MetricKind, f64)>,
}

impl EpochEvent {
    pub fn metric(&self, kind: MetricKind) -> Option<f64> {
        lookup(&self.metrics, kind)
    }

    pub fn val_metric(&self, kind: MetricKind) -> Option<f64> {
        lookup(&self.val_metrics, kind)
    }

    pub fn value(&self, monitored: Monitored) -> Option<f64> {
        match monitored {
            Monitored::Loss => Some(self.loss),
            Monitored::ValLoss => self.val_loss,
            Monitored::Metric(kind) => self.metric(kind),
            Monitored::ValMetric(kind) => self.val_metric(kind),
        }
    }
}

fn lookup(values: &[(MetricKind, f64)], kind: MetricKind) -> Option<f64> {
    values.iter().find(|(k, _)| *k == kind).map(|(_, v)| *v)
}

#[derive(Debug, Clone, Default)]
pub struct History {
    batch_events: Vec<BatchEvent>,
    epoch_events: Vec<EpochEvent>,
    batch_index: BTreeMap<(usize, usize), usize>,
    epoch_index: BTreeMap<usize, usize>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_batch_event(&mut self, event: BatchEvent) {
        self.batch_index.insert((event.epoch, event.batch), self.batch_events.len());
        self.batch_events.push(event);
    }

    pub fn append_epoch_event(&mut self, event: EpochEvent) {
        self.epoch_index.insert(event.epoch, self.epoch_events.len());
        self.epoch_events.push(event);
    }

    pub fn batch_events(&self) -> &[BatchEvent] {
        &self.batch_events
    }

    pub fn epoch_events(&self) -> &[EpochEvent] {
        &self.epoch_events
    }

    pub fn last_batch_event(&self) -> Option<&BatchEvent> {
        self.batch_events.last()
    }

    pub fn last_epoch_event(&self) -> Option<&EpochEvent> {
        self.epoch_events.last()
    }

    pub fn batch_event(&self, epoch: usize, batch: usize) -> Option<&BatchEvent> {
        self.batch_index.get(&(epoch, batch)).map(|&i| &self.batch_events[i])
    }

    pub fn epoch_event(&self, epoch: usize) -> Option<&EpochEvent> {
        self.epoch_index.get(&epoch).map(|&i| &self.epoch_events[i])
    }

    /// Batch events of one epoch ordered by batch index.
    pub fn events_by_epoch(&self, epoch: usize) -> Vec<&BatchEvent> {
        self.batch_index
            .range((epoch, 0)..=(epoch, usize::MAX))
            .map(|(_, &i)| &self.batch_events[i])
            .collect()
    }

    /// One value per epoch event that carries `monitored`.
    pub fn epoch_values(&self, monitored: Monitored) -> Vec<f64> {
        self.epoch_events.iter().filter_map(|e| e.value(monitored)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.batch_events.is_empty() && self.epoch_events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(epoch: usize, batch: usize, loss: f64) -> BatchEvent {
        BatchEvent { epoch, batch, batch_size: 2, loss, metrics: vec![(MetricKind::Mae, loss / 2.0)] }
    }

    #[test]
    fn test_lookup_by_epoch_and_batch() {
        let mut history = History::new();
        for epoch in 1..=2 {
            for b in 0..3 {
                history.append_batch_event(batch(epoch, b, (epoch * 10 + b) as f64));
            }
        }
        assert_eq!(history.batch_event(2, 1).unwrap().loss, 21.0);
        assert_eq!(history.last_batch_event().unwrap().loss, 22.0);
        let first: Vec<f64> = history.events_by_epoch(1).iter().map(|e| e.loss).collect();
        assert_eq!(first, vec![10.0, 11.0, 12.0]);
        assert!(history.events_by_epoch(3).is_empty());
        assert_eq!(history.batch_event(1, 0).unwrap().metric(MetricKind::Mae), Some(5.0));
    }

    #[test]
    fn test_epoch_values_skip_missing_validation() {
        let mut history = History::new();
        history.append_epoch_event(EpochEvent {
            epoch: 1,
            loss: 1.0,
            metrics: vec![(MetricKind::Accuracy, 0.5)],
            val_loss: None,
            val_metrics: vec![],
        });
        history.append_epoch_event(EpochEvent {
            epoch: 2,
            loss: 0.5,
            metrics: vec![(MetricKind::Accuracy, 0.75)],
            val_loss: Some(0.6),
            val_metrics: vec![(MetricKind::Accuracy, 0.7)],
        });
        assert_eq!(history.epoch_values(Monitored::Loss), vec![1.0, 0.5]);
        assert_eq!(history.epoch_values(Monitored::ValLoss), vec![0.6]);
        assert_eq!(history.epoch_values(Monitored::Metric(MetricKind::Accuracy)), vec![0.5, 0.75]);
        assert_eq!(history.last_epoch_event().unwrap().epoch, 2);
        assert_eq!(history.epoch_event(1).unwrap().val_metric(MetricKind::Accuracy), None);
    }
}
