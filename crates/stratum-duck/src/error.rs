//! Error taxonomy for the storage engine

use stratum_ir::{PatternError, PlanError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid object: {0}")]
    InvalidObject(String),

    #[error("Invalid attribute: {0}")]
    InvalidAttr(String),

    #[error("Incompatible types: {0}")]
    IncompatibleType(String),

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error("Unknown name: {0}")]
    NotFound(String),

    #[error("Query plan error: {0}")]
    Plan(#[from] PlanError),

    #[error("Database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
