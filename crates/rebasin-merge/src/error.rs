//! Error types for checkpoint loading and merging.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading, merging, or saving checkpoints.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Checkpoint loading error.
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    /// Pickle-based checkpoint formats are not loaded.
    #[error(
        "'{0}' is a legacy pickle checkpoint; convert it to safetensors first \
         (e.g. with `python -m safetensors.torch`) and merge the converted file"
    )]
    LegacyCheckpoint(PathBuf),

    /// Tensor dtype the loader does not decode.
    #[error("Unsupported dtype {dtype:?} for tensor '{key}'")]
    UnsupportedDtype {
        /// Tensor name.
        key: String,
        /// The offending safetensors dtype.
        dtype: safetensors::Dtype,
    },

    /// The two inputs detect as different architectures.
    #[error("Architecture mismatch: model A is {model_a}, model B is {model_b}")]
    ArchitectureMismatch {
        /// Architecture detected for model A.
        model_a: String,
        /// Architecture detected for model B.
        model_b: String,
    },

    /// Shape mismatch between the same tensor in the two models.
    #[error("Shape mismatch for tensor '{key}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Tensor name.
        key: String,
        /// Shape in model A.
        expected: Vec<usize>,
        /// Shape in model B.
        actual: Vec<usize>,
    },

    /// Output path already exists and overwriting was not requested.
    #[error("Output file already exists: {0}")]
    OutputExists(PathBuf),

    /// Invalid merge configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Alignment core error.
    #[error("Alignment error: {0}")]
    Core(#[from] rebasin_core::CoreError),

    /// Safetensors error.
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for merge operations.
pub type Result<T> = std::result::Result<T, MergeError>;
