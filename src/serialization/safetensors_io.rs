//! Named f32 arrays in the SafeTensors format.
//!
//! Used by the `JsonConfigSafeTensors` saving format to keep every variable of
//! a model in a single `weights.safetensors` file.

use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{SafeTensors, TensorView};
use safetensors::{serialize_to_file, Dtype};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SafeTensorsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    Format(#[from] safetensors::SafeTensorError),

    #[error("Unsupported dtype {0}")]
    UnsupportedDtype(String),

    #[error("Tensor '{name}' has shape {shape:?} but {actual} values")]
    ShapeMismatch { name: String, shape: Vec<usize>, actual: usize },
}

type Result<T> = std::result::Result<T, SafeTensorsError>;

/// Writes every array as an F32 tensor under its name.
pub fn save_safetensors<P: AsRef<Path>>(path: P, tensors: &BTreeMap<String, ArrayD<f32>>) -> Result<()> {
    // views borrow the byte buffers, so the buffers are built first
    let buffers: Vec<(&str, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, array)| {
            let bytes = array.iter().flat_map(|x| x.to_le_bytes()).collect();
            (name.as_str(), array.shape().to_vec(), bytes)
        })
        .collect();

    let mut views: Vec<(&str, TensorView<'_>)> = Vec::with_capacity(buffers.len());
    for (name, shape, bytes) in &buffers {
        views.push((*name, TensorView::new(Dtype::F32, shape.clone(), bytes)?));
    }
    serialize_to_file(views, &None, path.as_ref())?;
    Ok(())
}

/// Reads every tensor of the file; F64 tensors are narrowed to f32.
pub fn load_safetensors<P: AsRef<Path>>(path: P) -> Result<BTreeMap<String, ArrayD<f32>>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut result = BTreeMap::new();
    for (name, tensor) in tensors.tensors() {
        let values: Vec<f32> = match tensor.dtype() {
            Dtype::F32 => tensor
                .data()
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F64 => tensor
                .data()
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
                .collect(),
            other => return Err(SafeTensorsError::UnsupportedDtype(format!("{:?}", other))),
        };
        let shape = tensor.shape().to_vec();
        let actual = values.len();
        let array = ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|_| SafeTensorsError::ShapeMismatch {
            name: name.to_string(),
            shape: shape.clone(),
            actual,
        })?;
        result.insert(name.to_string(), array);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_save_and_load_keep_names_and_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let mut tensors = BTreeMap::new();
        tensors.insert("dense_1_dense_kernel".to_string(), array![[1.0f32, 2.0], [3.0, 4.0]].into_dyn());
        tensors.insert("optimizer_beta1_power".to_string(), ArrayD::from_elem(IxDyn(&[]), 0.81f32));

        save_safetensors(&path, &tensors).unwrap();
        let loaded = load_safetensors(&path).unwrap();
        assert_eq!(loaded, tensors);
    }

    #[test]
    fn test_missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load_safetensors(dir.path().join("nope")), Err(SafeTensorsError::Io(_))));
    }
}
