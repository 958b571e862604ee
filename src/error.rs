use arrow_schema::ArrowError;

use crate::structs::Stage;

/// Failures raised by an [`ObjectStore`](crate::store::ObjectStore) backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("sdk error: {0}")]
    Sdk(String),
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub(crate) fn from_sdk(err: impl std::fmt::Display) -> Self {
        Self::Sdk(err.to_string())
    }
}

/// Fatal errors of a dimension build. Any of these aborts the run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("no .parquet files found under {bucket}/{prefix}")]
    NoInputFiles { bucket: String, prefix: String },

    #[error("object store {operation} failed for '{key}'")]
    Storage {
        operation: &'static str,
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to decode '{key}' as parquet")]
    Decode {
        key: String,
        #[source]
        source: parquet::errors::ParquetError,
    },

    #[error("column '{column}' not found in '{key}'")]
    MissingColumn { key: String, column: String },

    #[error("failed to serialize the date dimension")]
    Serialize {
        #[source]
        source: parquet::errors::ParquetError,
    },

    #[error("failed to publish {bucket}/{key}")]
    Publish {
        bucket: String,
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("object store {operation} timed out for '{key}'")]
    Timeout { operation: &'static str, key: String },

    #[error("run cancelled before {stage}")]
    Cancelled { stage: Stage },

    #[error("Arrow Error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("Data Error: {0}")]
    Data(String),
}

/// Terminal failure of a run, tagged with the stage it originated in.
#[derive(Debug, thiserror::Error)]
#[error("run failed during {stage}")]
pub struct RunFailure {
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
