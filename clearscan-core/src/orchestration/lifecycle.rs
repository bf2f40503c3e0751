//! Job family bookkeeping: every transition applies to a parent job and all
//! of its children in one store write.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use clearscan_model::{JobId, JobState, PackageId, ScannerJob};

use crate::database::ScanStore;
use crate::error::{Result, ScanError};

/// A root job and its children. Children never have children.
#[derive(Clone, Debug)]
pub struct JobFamily {
    pub root: ScannerJob,
    pub children: Vec<ScannerJob>,
}

impl JobFamily {
    pub fn members(&self) -> impl Iterator<Item = &ScannerJob> {
        std::iter::once(&self.root).chain(self.children.iter())
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.members().map(|job| job.id).collect()
    }

    /// Distinct packages, root first.
    pub fn package_ids(&self) -> Vec<PackageId> {
        let mut seen = BTreeSet::new();
        self.members()
            .map(|job| job.package_id)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    fn eligible(&self, target: JobState) -> Vec<&ScannerJob> {
        self.members()
            .filter(|job| job.state.moves_to(target))
            .collect()
    }
}

#[derive(Clone)]
pub struct JobLifecycle {
    store: Arc<dyn ScanStore>,
}

impl fmt::Debug for JobLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobLifecycle").finish_non_exhaustive()
    }
}

impl JobLifecycle {
    pub fn new(store: Arc<dyn ScanStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ScanStore> {
        &self.store
    }

    /// Loads the family `job_id` belongs to. A child id resolves to its
    /// parent's family.
    pub async fn family(&self, job_id: JobId) -> Result<JobFamily> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("job {job_id}")))?;
        let root = match job.parent_id {
            Some(parent) => self
                .store
                .get_job(parent)
                .await?
                .ok_or_else(|| ScanError::NotFound(format!("parent job {parent}")))?,
            None => job,
        };
        let children = self.store.children_of(root.id).await?;
        Ok(JobFamily { root, children })
    }

    /// Moves every family member that may legally enter `target` into it.
    /// Members already there or unable to move are left alone; an illegal
    /// move of the root is reported as [`ScanError::InvalidTransition`],
    /// including when a concurrent write moved the root after it was read.
    pub async fn transition(&self, job_id: JobId, target: JobState) -> Result<u64> {
        let family = self.family(job_id).await?;
        let from = family.root.state;
        if !from.can_transition_to(target) {
            return Err(ScanError::InvalidTransition { from, to: target });
        }
        let ids: Vec<JobId> = family.eligible(target).iter().map(|job| job.id).collect();
        if ids.is_empty() {
            return Ok(0);
        }
        let changed = self.store.set_job_states(&ids, target, None).await?;
        if from != target && !changed.contains(&family.root.id) {
            self.ensure_root_in(&family.root, target).await?;
        }
        debug!(target: "scan::queue", root = %family.root.id, %from, to = %target, updated = changed.len(), "job family transitioned");
        Ok(changed.len() as u64)
    }

    /// Fails the whole family and its packages in one store operation.
    /// Members already in a final state keep it.
    pub async fn fail_family(&self, job_id: JobId, message: &str) -> Result<JobFamily> {
        let family = self.family(job_id).await?;
        let ids: Vec<JobId> = family
            .eligible(JobState::Failed)
            .iter()
            .map(|job| job.id)
            .collect();
        if ids.is_empty() {
            return Ok(family);
        }
        let failed = self.store.fail_jobs(&ids, message).await?;
        if !failed.is_empty() {
            warn!(target: "scan::queue", root = %family.root.id, jobs = failed.len(), reason = message, "job family failed");
        }
        Ok(family)
    }

    /// Packages to `scanned`, then every non-final member to `completed`.
    pub async fn complete_family(&self, job_id: JobId) -> Result<JobFamily> {
        let family = self.family(job_id).await?;
        let from = family.root.state;
        if !from.can_transition_to(JobState::Completed) {
            return Err(ScanError::InvalidTransition {
                from,
                to: JobState::Completed,
            });
        }
        let ids: Vec<JobId> = family
            .members()
            .filter(|job| !job.state.is_final())
            .map(|job| job.id)
            .collect();
        let completed = self.store.complete_jobs(&ids).await?;
        if from != JobState::Completed && !completed.contains(&family.root.id) {
            self.ensure_root_in(&family.root, JobState::Completed).await?;
        }
        Ok(family)
    }

    /// The guarded write skipped the root: fine if it already holds
    /// `target`, otherwise it moved somewhere `target` cannot follow.
    async fn ensure_root_in(&self, root: &ScannerJob, target: JobState) -> Result<()> {
        let current = self
            .store
            .get_job(root.id)
            .await?
            .map_or(root.state, |job| job.state);
        if current == target {
            return Ok(());
        }
        debug!(target: "scan::queue", root = %root.id, %current, to = %target, "root moved before the write");
        Err(ScanError::InvalidTransition {
            from: current,
            to: target,
        })
    }

    /// Compensating failure after an unrelated error. Never returns an error
    /// so the caller can surface the original one.
    pub async fn fail_best_effort(&self, job_id: JobId, message: &str) {
        if let Err(err) = self.fail_family(job_id, message).await {
            error!(%job_id, error = %err, "failed to mark job family as failed");
        }
    }
}
