//! Error types for the merge pipeline
//!
//! Every fatal condition of a run maps to one variant here; recoverable
//! conditions are collected as [`crate::context::Diagnostic`]s instead.
//! Messages name the dataset or file involved so the CLI can print them as-is.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error type for pipeline runs
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration file is missing, malformed or inconsistent
    #[error("Configuration error: {0}. Check the pipeline config file.")]
    Config(String),

    /// A remote dataset needs an API key and none was supplied
    #[error("Missing credential: environment variable '{env_var}' is not set. Export it or add it to .env before running.")]
    MissingCredential { env_var: String },

    /// A dataset could not be materialized after bounded retries
    #[error("Source unavailable for dataset '{dataset}': {cause}")]
    SourceUnavailable { dataset: String, cause: String },

    /// A dataset cannot take part in the merge
    #[error("Schema violation in dataset '{dataset}': {reason}")]
    SchemaViolation { dataset: String, reason: String },

    /// Writing the merged output failed; the partial file has been removed
    #[error("Failed to write output '{}': {cause}. Check free disk space and permissions.", path.display())]
    OutputWriteFailure { path: PathBuf, cause: String },

    /// File system operation failed
    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// Reading or writing delimited data failed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML config parsing failed
    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client could not be built or a request failed outside retry handling
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A blocking stage worker panicked or was cancelled
    #[error("Stage worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl PipelineError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a source-unavailable error
    pub fn source_unavailable(dataset: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            dataset: dataset.into(),
            cause: cause.into(),
        }
    }

    /// Create a schema violation error
    pub fn schema_violation(dataset: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SchemaViolation {
            dataset: dataset.into(),
            reason: reason.into(),
        }
    }

    /// Create an output write failure
    pub fn output_write(path: impl Into<PathBuf>, cause: impl std::fmt::Display) -> Self {
        Self::OutputWriteFailure {
            path: path.into(),
            cause: cause.to_string(),
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Yaml(_) => 2,
            Self::MissingCredential { .. } => 3,
            Self::SourceUnavailable { .. } => 4,
            Self::SchemaViolation { .. } => 5,
            Self::OutputWriteFailure { .. } => 6,
            _ => 1,
        }
    }
}
