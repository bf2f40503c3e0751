//! Contract for the external scanning worker.

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

use clearscan_model::{JobId, WorkerJobRequest, WorkerJobStatus};

pub mod http;

pub use http::HttpScanWorker;

#[derive(Error, Debug)]
pub enum WorkerError {
    /// Connection refused, DNS failure, or request timeout.
    #[error("scanner worker unreachable: {0}")]
    Unreachable(String),

    #[error("scanner worker returned {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("invalid scanner worker response: {0}")]
    Decode(String),
}

impl WorkerError {
    /// Timeouts, refused connections and every non-2xx answer. A response
    /// that arrived but could not be decoded is not retried.
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerError::Unreachable(_) | WorkerError::Status { .. } => true,
            WorkerError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            WorkerError::Unreachable(err.to_string())
        } else if let Some(status) = err.status() {
            WorkerError::Status {
                status,
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else if err.is_decode() {
            WorkerError::Decode(err.to_string())
        } else {
            WorkerError::Unreachable(err.to_string())
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScanWorker: Send + Sync {
    /// Enqueues the files for scanning. The job id is the queue item id, so
    /// re-submitting the same job does not duplicate work.
    async fn submit(&self, request: &WorkerJobRequest) -> Result<(), WorkerError>;

    /// Authoritative worker-side state. An unreachable worker is reported as
    /// [`clearscan_model::WorkerJobState::NoConnection`], not as an error.
    async fn job_status(&self, job_id: JobId) -> Result<WorkerJobStatus, WorkerError>;
}
