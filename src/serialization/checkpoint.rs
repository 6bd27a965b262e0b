//! Model directory layout.
//!
//! A saved model is a directory with:
//! ```text
//! model_dir/
//! ├── checkpoint.json        # format version, model and optimizer names
//! ├── graph.json             # GraphCustomVariables only: the whole graph
//! ├── modelConfig.json       # JsonConfig* formats: layer configuration
//! ├── variableNames.txt      # custom-variable formats: one name per line
//! ├── <variable>.txt         # space-separated values in row-major order
//! └── weights.safetensors    # JsonConfigSafeTensors only
//! ```

use super::safetensors_io::SafeTensorsError;
use crate::config::{SavingFormat, WritingMode};
use ndarray::{ArrayD, IxDyn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const METADATA_FILE: &str = "checkpoint.json";
pub const GRAPH_FILE: &str = "graph.json";
pub const MODEL_CONFIG_FILE: &str = "modelConfig.json";
pub const VARIABLE_NAMES_FILE: &str = "variableNames.txt";
pub const WEIGHTS_FILE: &str = "weights.safetensors";

pub const FORMAT_VERSION: &str = "1.0";

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },

    #[error("SafeTensors error: {0}")]
    SafeTensors(#[from] SafeTensorsError),

    #[error("JSON error in {path}: {source}")]
    Json { path: PathBuf, source: serde_json::Error },

    #[error("Checkpoint directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("Directory {0} is not empty")]
    DirectoryNotEmpty(PathBuf),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Variable '{name}' expects {expected} values, the file has {actual}")]
    ValueCount { name: String, expected: usize, actual: usize },

    #[error("Cannot parse '{token}' in {path}")]
    Parse { path: PathBuf, token: String },

    #[error("Unsupported checkpoint format version {0}")]
    UnsupportedVersion(String),
}

type Result<T> = std::result::Result<T, CheckpointError>;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io { path: path.to_path_buf(), source }
}

/// Contents of `checkpoint.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub format_version: String,
    pub model_name: String,
    pub saving_format: SavingFormat,
    pub optimizer: Option<String>,
    pub optimizer_state_saved: bool,
}

impl CheckpointMetadata {
    pub fn new(model_name: &str, saving_format: SavingFormat) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            model_name: model_name.to_string(),
            saving_format,
            optimizer: None,
            optimizer_state_saved: false,
        }
    }

    pub fn with_optimizer(mut self, name: &str) -> Self {
        self.optimizer = Some(name.to_string());
        self
    }

    pub fn with_optimizer_state_saved(mut self, saved: bool) -> Self {
        self.optimizer_state_saved = saved;
        self
    }
}

/// Creates `dir` or makes it ready for writing according to `mode`.
pub fn prepare_directory(dir: &Path, mode: WritingMode) -> Result<()> {
    if dir.exists() {
        let mut entries = fs::read_dir(dir).map_err(io_error(dir))?;
        let occupied = entries.next().is_some();
        match mode {
            WritingMode::FailIfExists if occupied => return Err(CheckpointError::DirectoryNotEmpty(dir.to_path_buf())),
            WritingMode::Override if occupied => {
                fs::remove_dir_all(dir).map_err(io_error(dir))?;
            }
            _ => {}
        }
    }
    fs::create_dir_all(dir).map_err(io_error(dir))
}

pub fn require_directory(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        Ok(())
    } else {
        Err(CheckpointError::DirectoryNotFound(dir.to_path_buf()))
    }
}

fn require_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(CheckpointError::FileNotFound(path.to_path_buf()))
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|source| CheckpointError::Json { path: path.to_path_buf(), source })?;
    fs::write(path, json).map_err(io_error(path))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    require_file(path)?;
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    serde_json::from_str(&text).map_err(|source| CheckpointError::Json { path: path.to_path_buf(), source })
}

pub fn write_metadata(dir: &Path, metadata: &CheckpointMetadata) -> Result<()> {
    write_json(&dir.join(METADATA_FILE), metadata)
}

pub fn read_metadata(dir: &Path) -> Result<CheckpointMetadata> {
    require_directory(dir)?;
    let metadata: CheckpointMetadata = read_json(&dir.join(METADATA_FILE))?;
    if metadata.format_version != FORMAT_VERSION {
        return Err(CheckpointError::UnsupportedVersion(metadata.format_version));
    }
    Ok(metadata)
}

/// Writes `variableNames.txt` and one text file per variable.
pub fn write_variables_text<'a, I>(dir: &Path, variables: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a ArrayD<f32>)>,
{
    let mut names = String::new();
    for (name, value) in variables {
        names.push_str(name);
        names.push('\n');
        let text = value.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ");
        let path = dir.join(format!("{}.txt", name));
        fs::write(&path, text).map_err(io_error(&path))?;
    }
    let manifest = dir.join(VARIABLE_NAMES_FILE);
    fs::write(&manifest, names).map_err(io_error(&manifest))
}

pub fn read_variable_names(dir: &Path) -> Result<Vec<String>> {
    let path = dir.join(VARIABLE_NAMES_FILE);
    require_file(&path)?;
    let text = fs::read_to_string(&path).map_err(io_error(&path))?;
    Ok(text.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect())
}

/// Parses `<name>.txt` into an array of `shape`; the value count must match exactly.
pub fn read_variable_text(dir: &Path, name: &str, shape: &[usize]) -> Result<ArrayD<f32>> {
    let path = dir.join(format!("{}.txt", name));
    require_file(&path)?;
    let text = fs::read_to_string(&path).map_err(io_error(&path))?;
    let values = text
        .split_whitespace()
        .map(|token| {
            token.parse::<f32>().map_err(|_| CheckpointError::Parse { path: path.clone(), token: token.to_string() })
        })
        .collect::<Result<Vec<f32>>>()?;
    let expected: usize = shape.iter().product();
    if values.len() != expected {
        return Err(CheckpointError::ValueCount { name: name.to_string(), expected, actual: values.len() });
    }
    ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| CheckpointError::ValueCount {
        name: name.to_string(),
        expected,
        actual: expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_variable_text_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = array![[0.5f32, -1.25], [3.0, 1e-8]].into_dyn();
        let bias = array![0.1f32, 0.2].into_dyn();
        write_variables_text(dir.path(), [("k", &kernel), ("b", &bias)]).unwrap();

        assert_eq!(read_variable_names(dir.path()).unwrap(), vec!["k", "b"]);
        assert_eq!(read_variable_text(dir.path(), "k", &[2, 2]).unwrap(), kernel);
        assert_eq!(read_variable_text(dir.path(), "b", &[2]).unwrap(), bias);
    }

    #[test]
    fn test_truncated_and_corrupt_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("short.txt"), "1 2 3").unwrap();
        fs::write(dir.path().join("bad.txt"), "1 x 3 4").unwrap();
        assert!(matches!(
            read_variable_text(dir.path(), "short", &[2, 2]),
            Err(CheckpointError::ValueCount { expected: 4, actual: 3, .. })
        ));
        assert!(matches!(read_variable_text(dir.path(), "bad", &[4]), Err(CheckpointError::Parse { .. })));
        assert!(matches!(read_variable_text(dir.path(), "missing", &[1]), Err(CheckpointError::FileNotFound(_))));
    }

    #[test]
    fn test_writing_modes() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("model");
        prepare_directory(&dir, WritingMode::FailIfExists).unwrap();
        fs::write(dir.join("stale.txt"), "1").unwrap();

        assert!(matches!(
            prepare_directory(&dir, WritingMode::FailIfExists),
            Err(CheckpointError::DirectoryNotEmpty(_))
        ));
        prepare_directory(&dir, WritingMode::Append).unwrap();
        assert!(dir.join("stale.txt").exists());
        prepare_directory(&dir, WritingMode::Override).unwrap();
        assert!(!dir.join("stale.txt").exists());
    }

    #[test]
    fn test_metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = CheckpointMetadata::new("mlp", SavingFormat::JsonConfigSafeTensors)
            .with_optimizer("Adam")
            .with_optimizer_state_saved(true);
        write_metadata(dir.path(), &metadata).unwrap();
        assert_eq!(read_metadata(dir.path()).unwrap(), metadata);
        assert!(matches!(
            read_metadata(&dir.path().join("absent")),
            Err(CheckpointError::DirectoryNotFound(_))
        ));
    }
}
