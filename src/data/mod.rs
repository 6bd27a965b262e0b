//! # Data
//!
//! [`Dataset`] holds features and labels in memory; [`BatchIter`] walks it
//! front to back in contiguous batches. Datasets are immutable: `split` and
//! `shuffle` return new datasets.

pub mod batch;
pub mod dataset;

pub use batch::{Batch, BatchIter};
pub use dataset::Dataset;
