//! In-memory dataset of parallel feature and label arrays.

use crate::error::{Error, Result};
use ndarray::{ArrayD, Axis, IxDyn, Slice};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;

use super::batch::BatchIter;

/// Immutable pair of feature and label arrays sharing the leading (example) axis.
///
/// Clones share the underlying storage.
#[derive(Debug, Clone)]
pub struct Dataset {
    features: Arc<ArrayD<f32>>,
    labels: Arc<ArrayD<f32>>,
}

impl Dataset {
    /// Both arrays must have a leading example axis of the same length.
    pub fn new(features: ArrayD<f32>, labels: ArrayD<f32>) -> Result<Self> {
        if features.ndim() < 2 {
            return Err(Error::config(format!(
                "features need an example axis and at least one feature axis, got shape {:?}",
                features.shape()
            )));
        }
        if labels.ndim() == 0 || labels.shape()[0] != features.shape()[0] {
            return Err(Error::config(format!(
                "{} feature rows but labels of shape {:?}",
                features.shape()[0],
                labels.shape()
            )));
        }
        Ok(Self { features: Arc::new(features), labels: Arc::new(labels) })
    }

    /// One-hot encodes integer class labels into `classes` columns.
    pub fn from_class_labels(features: ArrayD<f32>, labels: &[usize], classes: usize) -> Result<Self> {
        if classes == 0 {
            return Err(Error::config("number of classes must be positive"));
        }
        let mut one_hot = ArrayD::zeros(IxDyn(&[labels.len(), classes]));
        for (row, &class) in labels.iter().enumerate() {
            if class >= classes {
                return Err(Error::config(format!("label {} is outside of {} classes", class, classes)));
            }
            one_hot[[row, class]] = 1.0;
        }
        Self::new(features, one_hot)
    }

    pub fn len(&self) -> usize {
        self.features.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn features(&self) -> &ArrayD<f32> {
        &self.features
    }

    pub fn labels(&self) -> &ArrayD<f32> {
        &self.labels
    }

    /// Shape of one example, without the leading axis.
    pub fn feature_shape(&self) -> &[usize] {
        &self.features.shape()[1..]
    }

    pub fn label_shape(&self) -> &[usize] {
        &self.labels.shape()[1..]
    }

    /// `ceil(len / batch_size)`.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            0
        } else {
            self.len().div_ceil(batch_size)
        }
    }

    /// A fresh forward-only iterator starting at the first example.
    pub fn batch_iter(&self, batch_size: usize) -> Result<BatchIter<'_>> {
        if batch_size == 0 {
            return Err(Error::config("batch size must be positive"));
        }
        Ok(BatchIter::new(self, batch_size))
    }

    /// Contiguous rows `start..end` as an owned dataset.
    pub(crate) fn rows(&self, start: usize, end: usize) -> Dataset {
        let slice = Slice::from(start..end);
        Dataset {
            features: Arc::new(self.features.slice_axis(Axis(0), slice).to_owned()),
            labels: Arc::new(self.labels.slice_axis(Axis(0), slice).to_owned()),
        }
    }

    /// First `fraction` of the examples and the rest.
    pub fn split(&self, fraction: f64) -> Result<(Dataset, Dataset)> {
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(Error::config(format!("split fraction {} should be in range (0.0; 1.0).", fraction)));
        }
        let boundary = (self.len() as f64 * fraction).round() as usize;
        Ok((self.rows(0, boundary), self.rows(boundary, self.len())))
    }

    /// A copy with examples permuted reproducibly by `seed`.
    pub fn shuffle(&self, seed: u64) -> Dataset {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        Dataset {
            features: Arc::new(self.features.select(Axis(0), &indices)),
            labels: Arc::new(self.labels.select(Axis(0), &indices)),
        }
    }
}
