//! Entry points for the outer layers: job submission, job state and
//! results lookup, clearance resolution and result deletion.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{info, instrument, warn};

use clearscan_model::{
    BulkConclusionId, ClearanceGroupId, ContentHash, CopyrightFinding, JobId, JobState,
    LicenseFinding, Package, PackageScanStatus, PackageSpec, Purl, ScanIssue, ScannerJob,
};

use crate::clearance::{ClearanceCurator, ClearanceResolver, EffectiveClearance};
use crate::database::ScanStore;
use crate::error::{Result, ScanError};
use crate::orchestration::{
    ContentLedger, Dispatcher, IngestCoordinator, JobStatusBoard, OrchestratorConfig,
};
use crate::storage::{ObjectStorage, hash_key};
use crate::worker::ScanWorker;

/// A package named in a submission, either as a bare purl or by parts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmitTarget {
    Purl(String),
    Package(PackageTarget),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageTarget {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    /// When given, must render the same as the purl built from the parts.
    #[serde(default)]
    pub purl: Option<String>,
    #[serde(default)]
    pub declared_license: Option<String>,
}

impl SubmitTarget {
    pub fn normalize(self) -> Result<PackageSpec> {
        match self {
            SubmitTarget::Purl(raw) => Ok(PackageSpec {
                purl: raw.parse()?,
                declared_license: None,
            }),
            SubmitTarget::Package(target) => {
                let generated =
                    Purl::new(target.ty, target.namespace, target.name, target.version)?;
                if let Some(raw) = target.purl {
                    let explicit: Purl = raw.parse()?;
                    if explicit.canonical() != generated.canonical() {
                        return Err(ScanError::DataIntegrity(format!(
                            "package purl {explicit} does not match its parts ({generated})"
                        )));
                    }
                }
                Ok(PackageSpec {
                    purl: generated,
                    declared_license: target.declared_license,
                })
            }
        }
    }
}

/// Normalises every target and drops repeated purls, keeping the first.
pub fn normalize_targets(targets: Vec<SubmitTarget>) -> Result<Vec<PackageSpec>> {
    if targets.is_empty() {
        return Err(ScanError::InvalidRequest("no packages given".into()));
    }
    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(targets.len());
    for target in targets {
        let spec = target.normalize()?;
        if seen.insert(spec.purl.canonical()) {
            specs.push(spec);
        }
    }
    Ok(specs)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStateView {
    pub state: JobState,
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFindings {
    pub licenses: Vec<LicenseFinding>,
    pub copyrights: Vec<CopyrightFinding>,
    pub issues: Vec<ScanIssue>,
    /// Where each hash appears in the package.
    pub paths: BTreeMap<ContentHash, Vec<String>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ScanResults {
    Pending,
    NoResults,
    Results(ScanFindings),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionSummary {
    pub jobs: u64,
    pub file_trees: usize,
    pub files_removed: usize,
}

pub struct ScanService {
    store: Arc<dyn ScanStore>,
    storage: Arc<dyn ObjectStorage>,
    ingest: IngestCoordinator,
    status: JobStatusBoard,
    resolver: ClearanceResolver,
    curator: ClearanceCurator,
    job_timeout_secs: Option<u32>,
    tasks: TaskTracker,
}

impl fmt::Debug for ScanService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanService")
            .field("ingest", &self.ingest)
            .field("running_ingests", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl ScanService {
    pub fn new(
        store: Arc<dyn ScanStore>,
        storage: Arc<dyn ObjectStorage>,
        worker: Arc<dyn ScanWorker>,
        status: JobStatusBoard,
        config: &OrchestratorConfig,
    ) -> Self {
        let ledger = ContentLedger::new(store.clone(), config.dedup);
        let dispatcher = Dispatcher::new(worker, config.dispatch);
        let ingest = IngestCoordinator::new(
            store.clone(),
            storage.clone(),
            ledger,
            dispatcher,
            status.clone(),
            config.ingest.clone(),
        );
        Self {
            resolver: ClearanceResolver::new(store.clone()),
            curator: ClearanceCurator::new(store.clone()),
            store,
            storage,
            ingest,
            status,
            job_timeout_secs: config.dispatch.job_timeout_secs,
            tasks: TaskTracker::new(),
        }
    }

    pub fn status_board(&self) -> &JobStatusBoard {
        &self.status
    }

    pub fn curator(&self) -> &ClearanceCurator {
        &self.curator
    }

    /// Creates one parent job for the first package and a child job for
    /// every other one, then runs the ingest in the background.
    #[instrument(target = "scan::ingest", skip(self, targets))]
    pub async fn submit_job(&self, archive_key: &str, targets: Vec<SubmitTarget>) -> Result<JobId> {
        if archive_key.trim().is_empty() {
            return Err(ScanError::InvalidRequest("archive key is empty".into()));
        }
        let specs = normalize_targets(targets)?;

        let mut packages: Vec<Package> = Vec::with_capacity(specs.len());
        for spec in &specs {
            packages.push(self.store.upsert_package(spec).await?);
        }
        if packages
            .iter()
            .all(|p| p.scan_status == PackageScanStatus::Scanned)
        {
            return Err(ScanError::Conflict(
                "every requested package has already been scanned".into(),
            ));
        }

        let mut root = ScannerJob::new(packages[0].id, None);
        root.timeout_secs = self.job_timeout_secs;
        let mut jobs = vec![root.clone()];
        for package in &packages[1..] {
            let mut child = ScannerJob::new(package.id, Some(root.id));
            child.timeout_secs = self.job_timeout_secs;
            jobs.push(child);
        }
        self.store.insert_jobs(&jobs).await?;
        self.status.set(root.id, "Job created");
        info!(target: "scan::ingest", job_id = %root.id, packages = jobs.len(), "scan job submitted");

        let ingest = self.ingest.clone();
        let key = archive_key.to_string();
        let job_id = root.id;
        self.tasks.spawn(async move {
            if let Err(err) = ingest.ingest(job_id, &key).await {
                warn!(target: "scan::ingest", %job_id, error = %err, "ingest failed");
            }
        });
        Ok(job_id)
    }

    /// Waits for every background ingest started so far.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    pub async fn get_job_state(&self, job_id: JobId) -> Result<JobStateView> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("job {job_id}")))?;
        let message = if job.state == JobState::Failed {
            job.failure_message.clone()
        } else {
            self.status.get(job.parent_id.unwrap_or(job.id))
        };
        Ok(JobStateView {
            state: job.state,
            message,
        })
    }

    async fn package_by_purl(&self, raw: &str) -> Result<Option<Package>> {
        let purl: Purl = raw.parse()?;
        self.store.find_package_by_purl(&purl).await
    }

    pub async fn get_scan_results(&self, purl: &str) -> Result<ScanResults> {
        let Some(package) = self.package_by_purl(purl).await? else {
            return Ok(ScanResults::NoResults);
        };
        match package.scan_status {
            PackageScanStatus::Pending => return Ok(ScanResults::Pending),
            PackageScanStatus::NotScanned | PackageScanStatus::Failed => {
                return Ok(ScanResults::NoResults);
            }
            PackageScanStatus::Scanned => {}
        }

        let mut paths: BTreeMap<ContentHash, Vec<String>> = BTreeMap::new();
        for tree in self.store.file_trees_for_package(package.id).await? {
            paths.entry(tree.hash).or_default().push(tree.path);
        }
        let hashes: Vec<ContentHash> = paths.keys().cloned().collect();
        Ok(ScanResults::Results(ScanFindings {
            licenses: self.store.license_findings_for(&hashes).await?,
            copyrights: self.store.copyright_findings_for(&hashes).await?,
            issues: self.store.scan_issues_for(&hashes).await?,
            paths,
        }))
    }

    pub async fn resolve_clearance(
        &self,
        purl: &str,
        ranked_groups: &[ClearanceGroupId],
    ) -> Result<EffectiveClearance> {
        let package = self
            .package_by_purl(purl)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("package {purl}")))?;
        self.resolver.resolve(package.id, ranked_groups).await
    }

    /// Drops a package's scan results. Files left without any file tree are
    /// deleted together with their findings and stored objects.
    #[instrument(target = "scan::merge", skip(self))]
    pub async fn delete_scan_results(&self, purl: &str) -> Result<DeletionSummary> {
        let package = self
            .package_by_purl(purl)
            .await?
            .ok_or_else(|| ScanError::NotFound(format!("package {purl}")))?;

        let jobs = self.store.jobs_for_package(package.id).await?;
        if jobs.iter().any(|job| !job.state.is_final()) {
            return Err(ScanError::Conflict(format!(
                "a scan of {purl} is still running"
            )));
        }
        let job_ids: Vec<JobId> = jobs
            .iter()
            .filter(|job| job.state != JobState::ResultsDeleted)
            .map(|job| job.id)
            .collect();
        let jobs_updated = self
            .store
            .set_job_states(&job_ids, JobState::ResultsDeleted, None)
            .await?
            .len() as u64;
        self.store
            .set_package_status(&[package.id], PackageScanStatus::NotScanned)
            .await?;

        let released = self.store.delete_file_trees_for_package(package.id).await?;
        let file_trees = released.len();
        let released: BTreeSet<ContentHash> = released.into_iter().collect();

        let mut files_removed = 0;
        for hash in released {
            if self.store.count_file_trees_for_hash(&hash).await? > 0 {
                continue;
            }
            self.store.delete_file(&hash).await?;
            self.storage.delete(&hash_key(&hash)).await?;
            files_removed += 1;
        }

        info!(target: "scan::merge", %purl, jobs = jobs_updated, files_removed, "scan results deleted");
        Ok(DeletionSummary {
            jobs: jobs_updated,
            file_trees,
            files_removed,
        })
    }

    pub async fn delete_bulk_conclusion(&self, id: BulkConclusionId) -> Result<u64> {
        self.curator.delete_bulk_conclusion(id).await
    }
}
