//! Periodic reconciliation of non-final jobs against the worker.
//!
//! Every discrepancy except an explicit worker failure needs repeated,
//! identical observations before it is acted on. The observation history
//! lives in a [`SweepTracker`] owned by the caller, so a restart starts
//! counting from zero.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use clearscan_model::{JobId, JobState, ScannerJob, WorkerJobState};

use crate::database::ScanStore;
use crate::error::{Result, ScanError};
use crate::orchestration::config::SweeperConfig;
use crate::orchestration::lifecycle::JobLifecycle;
use crate::worker::ScanWorker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Observation {
    db: JobState,
    worker: Option<WorkerJobState>,
    streak: u32,
}

/// Consecutive identical `(db state, worker state)` observations per job.
#[derive(Debug, Default)]
pub struct SweepTracker {
    observations: HashMap<JobId, Observation>,
}

impl SweepTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the pair and returns how many sweeps in a row have seen it.
    pub fn observe(&mut self, job_id: JobId, db: JobState, worker: Option<WorkerJobState>) -> u32 {
        let entry = self.observations.entry(job_id).or_insert(Observation {
            db,
            worker,
            streak: 0,
        });
        if entry.db == db && entry.worker == worker {
            entry.streak += 1;
        } else {
            *entry = Observation {
                db,
                worker,
                streak: 1,
            };
        }
        entry.streak
    }

    pub fn streak(&self, job_id: JobId) -> u32 {
        self.observations.get(&job_id).map_or(0, |o| o.streak)
    }

    pub fn clear(&mut self, job_id: JobId) {
        self.observations.remove(&job_id);
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    fn retain(&mut self, live: &HashSet<JobId>) {
        self.observations.retain(|id, _| live.contains(id));
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inspected: usize,
    pub failed: usize,
    pub adopted: usize,
    pub pending: usize,
    /// Jobs skipped this pass because a store write failed.
    pub errors: usize,
}

enum Verdict {
    Fail(String),
    /// Fail the jobs but leave their packages alone.
    FailJobsOnly(String),
    Adopt(JobState),
    InSync,
    Wait,
}

#[derive(Clone)]
pub struct ReconciliationSweeper {
    store: Arc<dyn ScanStore>,
    worker: Arc<dyn ScanWorker>,
    lifecycle: JobLifecycle,
    config: SweeperConfig,
}

impl fmt::Debug for ReconciliationSweeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationSweeper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReconciliationSweeper {
    pub fn new(
        store: Arc<dyn ScanStore>,
        worker: Arc<dyn ScanWorker>,
        config: SweeperConfig,
    ) -> Self {
        let lifecycle = JobLifecycle::new(store.clone());
        Self {
            store,
            worker,
            lifecycle,
            config,
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// One pass over every non-final job. A store error on one job is
    /// logged and counted; the pass moves on to the next job.
    pub async fn sweep(&self, tracker: &mut SweepTracker) -> Result<SweepReport> {
        let jobs = self.store.jobs_in_states(&JobState::NON_FINAL).await?;
        let mut report = SweepReport::default();
        let mut live = HashSet::new();

        for job in &jobs {
            if job.is_child() {
                if let Err(err) = self.check_orphan(job, &mut report).await {
                    warn!(target: "scan::sweeper", job_id = %job.id, error = %err, "orphan check failed");
                    report.errors += 1;
                }
                continue;
            }
            live.insert(job.id);
            report.inspected += 1;

            if let Err(err) = self.reconcile(job, tracker, &mut report).await {
                warn!(target: "scan::sweeper", job_id = %job.id, state = %job.state, error = %err, "reconciling job failed");
                report.errors += 1;
            }
        }

        tracker.retain(&live);
        debug!(
            target: "scan::sweeper",
            inspected = report.inspected,
            failed = report.failed,
            adopted = report.adopted,
            pending = report.pending,
            errors = report.errors,
            "sweep finished"
        );
        Ok(report)
    }

    async fn reconcile(
        &self,
        job: &ScannerJob,
        tracker: &mut SweepTracker,
        report: &mut SweepReport,
    ) -> Result<()> {
        match self.judge(job, tracker).await {
            Verdict::Fail(message) => {
                warn!(target: "scan::sweeper", job_id = %job.id, state = %job.state, reason = %message, "failing job");
                self.lifecycle.fail_family(job.id, &message).await?;
                tracker.clear(job.id);
                report.failed += 1;
            }
            Verdict::FailJobsOnly(message) => {
                warn!(target: "scan::sweeper", job_id = %job.id, reason = %message, "failing unreachable job");
                let family = self.lifecycle.family(job.id).await?;
                self.store
                    .set_job_states(&family.job_ids(), JobState::Failed, Some(&message))
                    .await?;
                tracker.clear(job.id);
                report.failed += 1;
            }
            Verdict::Adopt(target) => {
                match self.lifecycle.transition(job.id, target).await {
                    Ok(_) => {
                        info!(target: "scan::sweeper", job_id = %job.id, from = %job.state, to = %target, "adopted worker state");
                        report.adopted += 1;
                    }
                    Err(ScanError::InvalidTransition { from, to }) => {
                        warn!(target: "scan::sweeper", job_id = %job.id, %from, %to, "worker state cannot be adopted");
                        report.pending += 1;
                    }
                    Err(err) => return Err(err),
                }
                tracker.clear(job.id);
            }
            Verdict::InSync => tracker.clear(job.id),
            Verdict::Wait => report.pending += 1,
        }
        Ok(())
    }

    async fn judge(&self, job: &ScannerJob, tracker: &mut SweepTracker) -> Verdict {
        if job.state.is_pre_queue() {
            let threshold = match job.state {
                JobState::Created => self.config.created_threshold,
                _ => self.config.processing_threshold,
            };
            let streak = tracker.observe(job.id, job.state, None);
            return if streak >= threshold {
                Verdict::Fail(format!("Job stuck in {} state", job.state))
            } else {
                Verdict::Wait
            };
        }

        let status = match self.worker.job_status(job.id).await {
            Ok(status) => status,
            Err(err) => {
                debug!(target: "scan::sweeper", job_id = %job.id, error = %err, "worker status lookup failed");
                clearscan_model::WorkerJobStatus::of(WorkerJobState::NoConnection)
            }
        };
        let worker_state = status.state;

        match worker_state {
            WorkerJobState::Failed => Verdict::Fail(
                status
                    .failed_reason
                    .unwrap_or_else(|| "Scanner reported the job as failed".to_string()),
            ),
            WorkerJobState::Completed if job.state != JobState::SavingResults => {
                Verdict::Fail("Scan completed but results were never saved".to_string())
            }
            WorkerJobState::Completed => {
                let streak = tracker.observe(job.id, job.state, Some(worker_state));
                if streak >= self.config.drift_threshold {
                    Verdict::Fail("Saving scan results did not finish".to_string())
                } else {
                    Verdict::Wait
                }
            }
            WorkerJobState::NotFound => {
                let streak = tracker.observe(job.id, job.state, Some(worker_state));
                if streak >= self.config.not_found_threshold {
                    Verdict::Fail("Job no longer exists on the scanner".to_string())
                } else {
                    Verdict::Wait
                }
            }
            WorkerJobState::NoConnection => {
                let streak = tracker.observe(job.id, job.state, Some(worker_state));
                if streak >= self.config.unreachable_threshold {
                    Verdict::FailJobsOnly("No connection to the scanner".to_string())
                } else {
                    Verdict::Wait
                }
            }
            other => match other.as_job_state() {
                Some(mapped) if mapped == job.state => Verdict::InSync,
                Some(mapped) => {
                    let streak = tracker.observe(job.id, job.state, Some(worker_state));
                    if streak >= self.config.drift_threshold {
                        Verdict::Adopt(mapped)
                    } else {
                        Verdict::Wait
                    }
                }
                None => Verdict::Wait,
            },
        }
    }

    /// A child whose parent already reached a final state cannot be moved by
    /// family operations anymore; fail it on its own.
    async fn check_orphan(&self, job: &ScannerJob, report: &mut SweepReport) -> Result<()> {
        let Some(parent_id) = job.parent_id else {
            return Ok(());
        };
        let parent_final = match self.store.get_job(parent_id).await? {
            Some(parent) => parent.state.is_final(),
            None => true,
        };
        if parent_final {
            warn!(target: "scan::sweeper", job_id = %job.id, %parent_id, "failing orphaned child job");
            self.store
                .fail_jobs(&[job.id], "Parent job finished without this job")
                .await?;
            report.failed += 1;
        }
        Ok(())
    }

    /// Fails every job still `processing` from before a restart, without
    /// hysteresis, and records an escalating alert per package.
    pub async fn recover_on_startup(&self) -> Result<usize> {
        let interrupted = self.store.jobs_in_states(&[JobState::Processing]).await?;
        let mut handled: HashSet<JobId> = HashSet::new();
        let mut recovered = 0;

        for job in interrupted {
            let root = job.parent_id.unwrap_or(job.id);
            if !handled.insert(root) {
                continue;
            }
            let family = self
                .lifecycle
                .fail_family(root, "Job interrupted by a server restart")
                .await?;
            recovered += 1;

            for package_id in family.package_ids() {
                let key = match self.store.get_package(package_id).await? {
                    Some(package) => format!("job-interrupted:{}", package.purl),
                    None => format!("job-interrupted:{package_id}"),
                };
                let alert = self
                    .store
                    .record_alert(&key, "Scan job was interrupted by a server restart")
                    .await?;
                warn!(
                    target: "scan::sweeper",
                    job_id = %root,
                    %package_id,
                    severity = alert.severity.as_str(),
                    occurrences = alert.occurrences,
                    "recovered interrupted job"
                );
            }
        }
        if recovered > 0 {
            info!(target: "scan::sweeper", recovered, "startup recovery finished");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_counts_only_identical_pairs() {
        let mut tracker = SweepTracker::new();
        let id = JobId::new();
        assert_eq!(tracker.observe(id, JobState::Created, None), 1);
        assert_eq!(tracker.observe(id, JobState::Created, None), 2);
        assert_eq!(tracker.observe(id, JobState::Processing, None), 1);
        assert_eq!(
            tracker.observe(id, JobState::Active, Some(WorkerJobState::NotFound)),
            1
        );
        assert_eq!(tracker.streak(id), 1);
        tracker.clear(id);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn one_failing_write_does_not_stop_the_sweep() {
        use crate::database::{InMemoryScanStore, JobRepository, PackageRepository};
        use crate::worker::MockScanWorker;
        use clearscan_model::PackageSpec;

        let store = InMemoryScanStore::new();
        let mut jobs = Vec::new();
        for name in ["stuck-a", "stuck-b"] {
            let package = store
                .upsert_package(&PackageSpec {
                    purl: format!("pkg:npm/{name}@1.0.0").parse().unwrap(),
                    declared_license: None,
                })
                .await
                .unwrap();
            jobs.push(ScannerJob::new(package.id, None));
        }
        store.insert_jobs(&jobs).await.unwrap();
        store.reject_writes_for(jobs[0].id).await;

        // Created jobs never reach the worker.
        let sweeper = ReconciliationSweeper::new(
            Arc::new(store.clone()),
            Arc::new(MockScanWorker::new()),
            SweeperConfig::default(),
        );
        let mut tracker = SweepTracker::new();
        sweeper.sweep(&mut tracker).await.unwrap();
        let report = sweeper.sweep(&mut tracker).await.unwrap();

        assert_eq!(report.errors, 1);
        assert_eq!(report.failed, 1);
        let blocked = store.get_job(jobs[0].id).await.unwrap().unwrap();
        assert_eq!(blocked.state, JobState::Created);
        let failed = store.get_job(jobs[1].id).await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
    }
}
