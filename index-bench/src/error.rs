//! Error taxonomy.
//!
//! Errors at or above the dataset boundary ([`ConfigError`], [`LoadError`],
//! lifecycle violations) end the experiment. Errors below it are absorbed:
//! a [`VariantError`] flags one variant, a [`QueryError`] becomes a failed run.

use bench_core::types::PlanError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration. Always raised before storage is touched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field}: rate must be within [0, 1] (got {value})")]
    InvalidRate { field: String, value: f64 },
    #[error("{field}: weight table is empty")]
    EmptyWeights { field: String },
    #[error("{field}: weight of {entry:?} must be finite and >= 0 (got {weight})")]
    InvalidWeight {
        field: String,
        entry: String,
        weight: f64,
    },
    #[error("{field}: weights must sum to a positive value")]
    ZeroWeights { field: String },
    #[error("{field}: {detail}")]
    Invalid { field: String, detail: String },
    #[error("query {query}: {detail}")]
    Query { query: String, detail: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, detail: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            detail: detail.into(),
        }
    }
}

/// A storage call that did not succeed.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("bulk transfer wrote {actual} rows, expected {expected}")]
    RowCountMismatch { expected: u64, actual: u64 },
    #[error("{0}")]
    Rejected(String),
}

/// Dataset load failure. Fatal: every variant depends on the shared dataset.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("schema reset or bulk transfer rejected: {0}")]
    Storage(#[source] StorageError),
    #[error("bulk load wrote {actual} rows, expected {expected}")]
    RowCountMismatch { expected: u64, actual: u64 },
    #[error("existing dataset has {actual} rows, expected {expected}")]
    DatasetMismatch { expected: u64, actual: u64 },
}

impl From<StorageError> for LoadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RowCountMismatch { expected, actual } => {
                LoadError::RowCountMismatch { expected, actual }
            }
            other => LoadError::Storage(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum VariantError {
    #[error("variant {requested} cannot be applied while {active} is still active")]
    AlreadyActive { active: String, requested: String },
    #[error("variant {variant} is not the active variant")]
    NotActive { variant: String },
    #[error("apply of variant {variant} failed: {source}")]
    Apply {
        variant: String,
        #[source]
        source: StorageError,
    },
    #[error("statistics refresh after applying {variant} failed: {source}")]
    StatisticsRefresh {
        variant: String,
        #[source]
        source: StorageError,
    },
    #[error("revert of variant {variant} failed: {source}")]
    Revert {
        variant: String,
        #[source]
        source: StorageError,
    },
    #[error("revert of variant {variant} did not restore the schema: {diff}")]
    NotIsolated { variant: String, diff: String },
}

impl VariantError {
    /// Lifecycle misuse, as opposed to a storage-side failure of one variant.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VariantError::AlreadyActive { .. } | VariantError::NotActive { .. }
        )
    }
}

/// Failure of a single query execution. Recorded on the run, never raised.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("plan capture failed: {0}")]
    Plan(#[from] PlanError),
    #[error("no value bound for parameter :{0}")]
    MissingParameter(String),
}

/// Results could not be written. The measurements themselves are unaffected.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("dataset load failed: {0}")]
    Load(#[from] LoadError),
    #[error("variant lifecycle violated: {0}")]
    Variant(#[from] VariantError),
    #[error("session setup failed: {0}")]
    Session(#[source] StorageError),
    #[error("experiment cancelled")]
    Cancelled,
}
