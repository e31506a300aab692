//! Error types for the papermap pipeline.
//!
//! Every stage fails fast at its boundary. Variants that concern individual
//! papers carry the offending record identifiers so a failed run can be traced
//! back to the rows in the source store.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PapermapError {
    #[error("Record '{record_id}' is missing required field '{field}'")]
    MissingField {
        record_id: String,
        field: &'static str,
    },

    #[error("Duplicate invariant violated on {key}: records {}", .record_ids.join(", "))]
    DuplicateInvariantViolation { key: String, record_ids: Vec<String> },

    #[error(
        "No cluster centroids available to assign {} unassigned record(s): {}",
        .record_ids.len(),
        .record_ids.join(", ")
    )]
    EmptyClusterCentroid { record_ids: Vec<String> },

    #[error("Schema mismatch in {}: {detail}", .path.display())]
    SchemaMismatch { path: PathBuf, detail: String },

    #[error("Record '{record_id}' has embedding dimension {actual}, expected {expected}")]
    DimensionMismatch {
        record_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("Projection error: {0}")]
    Projection(String),

    #[error("Render error: {0}")]
    Render(String),

    #[error("Citation lookup error: {0}")]
    Citation(String),

    #[error("Python runtime error: {0}")]
    Python(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Template error: {0}")]
    Template(#[from] handlebars::RenderError),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PapermapError>;

impl PapermapError {
    pub fn missing_field(record_id: impl Into<String>, field: &'static str) -> Self {
        Self::MissingField {
            record_id: record_id.into(),
            field,
        }
    }

    pub fn schema_mismatch(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            path: path.into(),
            detail: detail.into(),
        }
    }

    pub fn projection(msg: impl Into<String>) -> Self {
        Self::Projection(msg.into())
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Record identifiers implicated by this error, if any.
    pub fn record_ids(&self) -> Vec<&str> {
        match self {
            Self::MissingField { record_id, .. } | Self::DimensionMismatch { record_id, .. } => {
                vec![record_id.as_str()]
            }
            Self::DuplicateInvariantViolation { record_ids, .. }
            | Self::EmptyClusterCentroid { record_ids } => {
                record_ids.iter().map(String::as_str).collect()
            }
            _ => Vec::new(),
        }
    }
}
