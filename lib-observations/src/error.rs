//! Observation store errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("schema version mismatch: found v{found}, supported up to v{supported}")]
    SchemaMismatch { found: i64, supported: i64 },

    #[error("migration to v{version} failed: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("write conflict: {0}")]
    WriteConflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
