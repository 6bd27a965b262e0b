//! On-disk formats of saved networks.
//!
//! - [`checkpoint`]: the model directory layout, metadata and per-variable text files
//! - [`safetensors_io`]: all variables of a model in one SafeTensors file

pub mod checkpoint;
pub mod safetensors_io;

pub use checkpoint::{CheckpointError, CheckpointMetadata};
pub use safetensors_io::{load_safetensors, save_safetensors, SafeTensorsError};
