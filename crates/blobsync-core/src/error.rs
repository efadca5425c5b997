// crates/blobsync-core/src/error.rs

use std::path::PathBuf;

use blobsync_bucket::BucketError;
use thiserror::Error;

use crate::lock::LockError;

/// The downloaded (or about to be inserted) data does not match the
/// statically declared table schema.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("artifact is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("artifact must be an object mapping table names to row arrays")]
    NotAnObject,

    #[error("artifact is missing table '{0}'")]
    MissingTable(String),

    #[error("'{0}' is not a tracked table")]
    UnexpectedTable(String),

    #[error("table '{0}' must be an array of rows")]
    NotAnArray(String),

    #[error("row {row} of table '{table}' is not an object")]
    RowNotObject { table: String, row: usize },

    #[error("row {row} of table '{table}' is missing column '{column}'")]
    MissingColumn {
        table: String,
        row: usize,
        column: String,
    },

    #[error("row {row} of table '{table}' has undeclared column '{column}'")]
    UnexpectedColumn {
        table: String,
        row: usize,
        column: String,
    },

    #[error("row {row} of table '{table}': column '{column}' expects {expected}, found {found}")]
    InvalidValue {
        table: String,
        row: usize,
        column: String,
        expected: &'static str,
        found: String,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingEnv(String),

    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid container configuration: {0}")]
    Container(String),

    #[error("artifact name collision: '{0}' is listed more than once")]
    ArtifactCollision(String),
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] BucketError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("run lock unavailable: {0}")]
    Lock(#[from] LockError),
}

impl JobError {
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Configuration(_) => "ConfigurationError",
            JobError::Storage(_) => "StorageError",
            JobError::Database(_) => "DatabaseError",
            JobError::Schema(_) => "SchemaError",
            JobError::Lock(_) => "LockError",
        }
    }
}

pub type Result<T, E = JobError> = std::result::Result<T, E>;
