use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use clearscan_model::{JobId, WorkerFile, WorkerJobOptions, WorkerJobRequest};

use crate::error::{Result, ScanError};
use crate::orchestration::config::DispatchConfig;
use crate::worker::ScanWorker;

/// Submits scan work to the worker queue with a bounded, fixed-delay retry.
#[derive(Clone)]
pub struct Dispatcher {
    worker: Arc<dyn ScanWorker>,
    config: DispatchConfig,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(worker: Arc<dyn ScanWorker>, config: DispatchConfig) -> Self {
        Self { worker, config }
    }

    pub fn timeout_secs(&self) -> Option<u32> {
        self.config.job_timeout_secs
    }

    /// Retries transient worker errors up to `max_attempts`. The job id is reused on every
    /// attempt so the worker never queues the same work twice.
    pub async fn submit(
        &self,
        job_id: JobId,
        files: Vec<WorkerFile>,
        timeout_secs: Option<u32>,
    ) -> Result<()> {
        let request = WorkerJobRequest {
            job_id,
            files,
            options: WorkerJobOptions {
                timeout: timeout_secs,
            },
        };
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.worker.submit(&request).await {
                Ok(()) => {
                    info!(target: "scan::queue", %job_id, files = request.files.len(), attempt, "job dispatched");
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    warn!(target: "scan::queue", %job_id, attempt, max_attempts, error = %err, "dispatch failed; retrying");
                    tokio::time::sleep(self.config.retry_delay()).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(target: "scan::queue", %job_id, attempt, error = %err, "dispatch failed");
                    return Err(ScanError::Worker(err));
                }
            }
        }
    }
}
