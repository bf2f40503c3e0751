use clearscan_model::{JobState, ModelError};
use thiserror::Error;

use crate::worker::WorkerError;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Scanner worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Invalid model value: {0}")]
    Model(#[from] ModelError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Object storage error: {0}")]
    Storage(String),

    #[error("Illegal job transition {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Errors caused by the caller's input; surfaced as 4xx by the HTTP layer.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ScanError::NotFound(_)
                | ScanError::InvalidRequest(_)
                | ScanError::DataIntegrity(_)
                | ScanError::Conflict(_)
                | ScanError::Model(_)
        )
    }

    /// Errors worth retrying against the worker.
    pub fn is_transient(&self) -> bool {
        match self {
            ScanError::Worker(err) => err.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
