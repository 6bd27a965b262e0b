//! Forward-only batch iteration.

use super::dataset::Dataset;
use ndarray::{ArrayD, Axis, Slice};

/// A contiguous slice of a dataset.
#[derive(Debug, Clone)]
pub struct Batch {
    pub features: ArrayD<f32>,
    pub labels: ArrayD<f32>,
    /// Index of the first example of the batch in the dataset.
    pub offset: usize,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.features.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Yields `ceil(N / batch_size)` batches; the last one holds what remains.
///
/// The iterator cannot be rewound. Ask the dataset for a new one to start over.
#[derive(Debug)]
pub struct BatchIter<'a> {
    dataset: &'a Dataset,
    batch_size: usize,
    position: usize,
}

impl<'a> BatchIter<'a> {
    pub(crate) fn new(dataset: &'a Dataset, batch_size: usize) -> Self {
        Self { dataset, batch_size, position: 0 }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

impl Iterator for BatchIter<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let total = self.dataset.len();
        if self.position >= total {
            return None;
        }
        let start = self.position;
        let end = (start + self.batch_size).min(total);
        self.position = end;
        let rows = Slice::from(start..end);
        Some(Batch {
            features: self.dataset.features().slice_axis(Axis(0), rows).to_owned(),
            labels: self.dataset.labels().slice_axis(Axis(0), rows).to_owned(),
            offset: start,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.dataset.len().saturating_sub(self.position).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for BatchIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn};

    fn dataset(n: usize) -> Dataset {
        Dataset::new(ArrayD::zeros(IxDyn(&[n, 3])), ArrayD::zeros(IxDyn(&[n, 1]))).unwrap()
    }

    #[test]
    fn test_batches_cover_every_example_once() {
        for n in 1..12 {
            for batch_size in 1..7 {
                let ds = dataset(n);
                let sizes: Vec<usize> = ds.batch_iter(batch_size).unwrap().map(|b| b.len()).collect();
                assert_eq!(sizes.len(), n.div_ceil(batch_size), "n={} b={}", n, batch_size);
                assert_eq!(sizes.iter().sum::<usize>(), n);
                assert!(sizes[..sizes.len() - 1].iter().all(|&s| s == batch_size));
            }
        }
    }

    #[test]
    fn test_final_partial_batch_and_offsets() {
        let ds = dataset(7);
        let mut iter = ds.batch_iter(3).unwrap();
        assert_eq!(iter.len(), 3);
        let offsets: Vec<(usize, usize)> = iter.by_ref().map(|b| (b.offset, b.len())).collect();
        assert_eq!(offsets, vec![(0, 3), (3, 3), (6, 1)]);
        assert!(iter.next().is_none());
        // a new iterator starts from the beginning
        assert_eq!(ds.batch_iter(3).unwrap().next().unwrap().offset, 0);
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        assert!(dataset(2).batch_iter(0).is_err());
    }
}
