//! Static tensor shapes with an unknown (batch) dimension.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered list of dimensions; `None` marks a dimension unknown at build time,
/// usually the leading batch axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    dims: Vec<Option<usize>>,
}

impl TensorShape {
    pub fn new(dims: Vec<Option<usize>>) -> Self {
        Self { dims }
    }

    /// Fully known shape, e.g. the shape of a variable.
    pub fn known(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().map(|&d| Some(d)).collect(),
        }
    }

    /// `(None, tail...)`: the shape of a batch whose size is decided at run time.
    pub fn with_unknown_batch(tail: &[usize]) -> Self {
        let mut dims = Vec::with_capacity(tail.len() + 1);
        dims.push(None);
        dims.extend(tail.iter().map(|&d| Some(d)));
        Self { dims }
    }

    pub fn scalar() -> Self {
        Self { dims: vec![] }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Option<usize>] {
        &self.dims
    }

    pub fn dim(&self, index: usize) -> Option<usize> {
        self.dims.get(index).copied().flatten()
    }

    pub fn last(&self) -> Option<usize> {
        self.dims.last().copied().flatten()
    }

    /// Every dimension except the first.
    pub fn tail(&self) -> &[Option<usize>] {
        if self.dims.is_empty() {
            &self.dims
        } else {
            &self.dims[1..]
        }
    }

    /// The tail as concrete sizes, if every one of them is known.
    pub fn known_tail(&self) -> Option<Vec<usize>> {
        self.tail().iter().copied().collect()
    }

    /// The whole shape as concrete sizes, if known.
    pub fn to_known(&self) -> Option<Vec<usize>> {
        self.dims.iter().copied().collect()
    }

    /// True when every non-batch dimension is known and strictly positive.
    pub fn has_positive_tail(&self) -> bool {
        self.tail().iter().all(|d| matches!(d, Some(n) if *n > 0))
    }

    pub fn replace_last(&self, value: usize) -> Self {
        let mut dims = self.dims.clone();
        if let Some(last) = dims.last_mut() {
            *last = Some(value);
        }
        Self { dims }
    }

    /// Product of the tail dimensions, `None` if any of them is unknown.
    pub fn tail_elements(&self) -> Option<usize> {
        self.tail()
            .iter()
            .try_fold(1usize, |acc, d| d.map(|n| acc * n))
    }

    pub fn num_elements(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |acc, d| d.map(|n| acc * n))
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match d {
                Some(n) => write!(f, "{}", n)?,
                None => write!(f, "None")?,
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_batch_tail() {
        let shape = TensorShape::with_unknown_batch(&[28, 28, 1]);
        assert_eq!(shape.rank(), 4);
        assert_eq!(shape.dim(0), None);
        assert_eq!(shape.known_tail(), Some(vec![28, 28, 1]));
        assert_eq!(shape.tail_elements(), Some(784));
        assert_eq!(shape.num_elements(), None);
        assert!(shape.has_positive_tail());
    }

    #[test]
    fn test_replace_last_and_display() {
        let shape = TensorShape::with_unknown_batch(&[4]).replace_last(8);
        assert_eq!(shape.to_string(), "(None, 8)");
        assert!(!TensorShape::with_unknown_batch(&[0, 3]).has_positive_tail());
    }
}
