//! Mirrors worker queue events onto job families.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use clearscan_model::{JobId, QueueEvent, QueueEventKind, ScanResultPayload};

use crate::error::{Result, ScanError};
use crate::orchestration::lifecycle::JobLifecycle;
use crate::orchestration::merger::ResultsMerger;
use crate::orchestration::status_board::JobStatusBoard;
use crate::worker::ScanWorker;

#[derive(Clone)]
pub struct QueueEventSync {
    lifecycle: JobLifecycle,
    merger: ResultsMerger,
    worker: Arc<dyn ScanWorker>,
    status: JobStatusBoard,
}

impl fmt::Debug for QueueEventSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEventSync").finish_non_exhaustive()
    }
}

impl QueueEventSync {
    pub fn new(
        lifecycle: JobLifecycle,
        merger: ResultsMerger,
        worker: Arc<dyn ScanWorker>,
        status: JobStatusBoard,
    ) -> Self {
        Self {
            lifecycle,
            merger,
            worker,
            status,
        }
    }

    /// Consumes events until cancelled or the bus closes. A lagging receiver
    /// drops events; the sweeper reconciles whatever was missed.
    pub async fn run(
        &self,
        mut events: broadcast::Receiver<QueueEvent>,
        cancel: CancellationToken,
    ) {
        info!(target: "scan::queue", "queue event sync started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        if let Err(err) = self.handle(event.clone()).await {
                            error!(target: "scan::queue", %event, error = %err, "queue event handling failed");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "scan::queue", skipped, "queue event receiver lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!(target: "scan::queue", "queue event sync stopped");
    }

    pub async fn handle(&self, event: QueueEvent) -> Result<()> {
        let QueueEvent { job_id, kind } = event;
        match kind {
            QueueEventKind::Failed { reason } => {
                let message = reason.unwrap_or_else(|| "Scanner job failed".to_string());
                self.status.set(job_id, format!("Scan failed: {message}"));
                self.lifecycle.fail_family(job_id, &message).await?;
                Ok(())
            }
            QueueEventKind::Completed { result } => {
                let payload = match result {
                    Some(payload) => *payload,
                    None => match self.fetch_result(job_id).await? {
                        Some(payload) => payload,
                        None => {
                            self.lifecycle
                                .fail_family(job_id, "Scanner reported completion without results")
                                .await?;
                            return Ok(());
                        }
                    },
                };
                self.status.set(job_id, "Saving scan results");
                self.merger.merge(job_id, &payload).await?;
                self.status.set(job_id, "Scan results saved");
                Ok(())
            }
            other => {
                let target = other.target_state();
                match self.lifecycle.transition(job_id, target).await {
                    Ok(_) => Ok(()),
                    Err(ScanError::InvalidTransition { from, to }) => {
                        debug!(target: "scan::queue", %job_id, %from, %to, "ignoring stale queue event");
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    async fn fetch_result(&self, job_id: JobId) -> Result<Option<ScanResultPayload>> {
        let status = self.worker.job_status(job_id).await?;
        Ok(status.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{InMemoryScanStore, JobRepository, PackageRepository};
    use crate::orchestration::config::MergeConfig;
    use crate::worker::MockScanWorker;
    use clearscan_model::{JobState, PackageScanStatus, PackageSpec, ScannerJob};

    async fn fan_out(store: &InMemoryScanStore) -> Vec<ScannerJob> {
        let mut jobs: Vec<ScannerJob> = Vec::new();
        for name in ["one", "two", "three"] {
            let package = store
                .upsert_package(&PackageSpec {
                    purl: format!("pkg:pypi/{name}@2.0").parse().unwrap(),
                    declared_license: None,
                })
                .await
                .unwrap();
            let parent = jobs.first().map(|j| j.id);
            let mut job = ScannerJob::new(package.id, parent);
            job.state = JobState::Queued;
            jobs.push(job);
        }
        store.insert_jobs(&jobs).await.unwrap();
        jobs
    }

    fn sync(store: &InMemoryScanStore, worker: MockScanWorker) -> QueueEventSync {
        let store: Arc<dyn crate::database::ScanStore> = Arc::new(store.clone());
        QueueEventSync::new(
            JobLifecycle::new(store.clone()),
            ResultsMerger::new(store, MergeConfig::default()),
            Arc::new(worker),
            JobStatusBoard::new(),
        )
    }

    #[tokio::test]
    async fn queue_states_propagate_to_children() {
        let store = InMemoryScanStore::new();
        let jobs = fan_out(&store).await;
        let sync = sync(&store, MockScanWorker::new());

        sync.handle(QueueEvent::new(jobs[0].id, QueueEventKind::Active))
            .await
            .unwrap();
        for job in &jobs {
            let stored = store.get_job(job.id).await.unwrap().unwrap();
            assert_eq!(stored.state, JobState::Active);
        }
    }

    #[tokio::test]
    async fn failed_event_fails_every_job_and_package() {
        let store = InMemoryScanStore::new();
        let jobs = fan_out(&store).await;
        let sync = sync(&store, MockScanWorker::new());

        sync.handle(QueueEvent::new(
            jobs[0].id,
            QueueEventKind::Failed {
                reason: Some("scanner timed out".into()),
            },
        ))
        .await
        .unwrap();

        for job in &jobs {
            let stored = store.get_job(job.id).await.unwrap().unwrap();
            assert_eq!(stored.state, JobState::Failed);
            assert_eq!(stored.failure_message.as_deref(), Some("scanner timed out"));
            let package = store.get_package(job.package_id).await.unwrap().unwrap();
            assert_eq!(package.scan_status, PackageScanStatus::Failed);
        }
    }

    #[tokio::test]
    async fn stale_events_after_failure_are_ignored() {
        let store = InMemoryScanStore::new();
        let jobs = fan_out(&store).await;
        let sync = sync(&store, MockScanWorker::new());

        sync.handle(QueueEvent::new(jobs[0].id, QueueEventKind::Failed { reason: None }))
            .await
            .unwrap();
        sync.handle(QueueEvent::new(jobs[0].id, QueueEventKind::Stalled))
            .await
            .unwrap();
        let stored = store.get_job(jobs[0].id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
    }

    #[tokio::test]
    async fn completion_without_payload_fetches_from_worker() {
        let store = InMemoryScanStore::new();
        let jobs = fan_out(&store).await;
        let mut worker = MockScanWorker::new();
        worker.expect_job_status().times(1).returning(|_| {
            Ok(clearscan_model::WorkerJobStatus::of(
                clearscan_model::WorkerJobState::Completed,
            ))
        });
        let sync = sync(&store, worker);

        sync.handle(QueueEvent::new(jobs[0].id, QueueEventKind::Completed { result: None }))
            .await
            .unwrap();
        let stored = store.get_job(jobs[2].id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
    }
}
