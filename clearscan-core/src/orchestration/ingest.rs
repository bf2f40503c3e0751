//! Archive ingest: download, extract, hash, dedup, upload and dispatch.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, stream};
use tracing::{info, instrument, warn};

use clearscan_model::{JobId, JobState, PackageScanStatus, WorkerFile};

use crate::database::ScanStore;
use crate::error::{Result, ScanError};
use crate::orchestration::archive::{extract_tar_gz, hash_tree};
use crate::orchestration::config::IngestConfig;
use crate::orchestration::dispatcher::Dispatcher;
use crate::orchestration::ledger::ContentLedger;
use crate::orchestration::lifecycle::{JobFamily, JobLifecycle};
use crate::orchestration::status_board::JobStatusBoard;
use crate::storage::ObjectStorage;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Regular files found in the archive.
    pub files_total: usize,
    /// Files sent to the worker after dedup.
    pub files_dispatched: usize,
}

#[derive(Clone)]
pub struct IngestCoordinator {
    store: Arc<dyn ScanStore>,
    storage: Arc<dyn ObjectStorage>,
    ledger: ContentLedger,
    dispatcher: Dispatcher,
    lifecycle: JobLifecycle,
    status: JobStatusBoard,
    config: IngestConfig,
}

impl fmt::Debug for IngestCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestCoordinator")
            .field("config", &self.config)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl IngestCoordinator {
    pub fn new(
        store: Arc<dyn ScanStore>,
        storage: Arc<dyn ObjectStorage>,
        ledger: ContentLedger,
        dispatcher: Dispatcher,
        status: JobStatusBoard,
        config: IngestConfig,
    ) -> Self {
        let lifecycle = JobLifecycle::new(store.clone());
        Self {
            store,
            storage,
            ledger,
            dispatcher,
            lifecycle,
            status,
            config,
        }
    }

    /// Runs the whole pipeline for the family rooted at `job_id`. On any
    /// failure after the family is marked `processing`, jobs and packages
    /// are moved to `failed` before the error is returned.
    #[instrument(target = "scan::ingest", skip(self))]
    pub async fn ingest(&self, job_id: JobId, archive_key: &str) -> Result<IngestOutcome> {
        let family = self.lifecycle.family(job_id).await?;
        self.store
            .set_package_status(&family.package_ids(), PackageScanStatus::Pending)
            .await?;
        self.lifecycle.transition(job_id, JobState::Processing).await?;

        match self.run(&family, archive_key).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let message = format!("Ingest failed: {err}");
                self.status.set(family.root.id, message.clone());
                self.lifecycle.fail_best_effort(family.root.id, &message).await;
                Err(err)
            }
        }
    }

    async fn run(&self, family: &JobFamily, archive_key: &str) -> Result<IngestOutcome> {
        let root_id = family.root.id;
        let scratch = match &self.config.work_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                tempfile::Builder::new().prefix("clearscan-").tempdir_in(dir)?
            }
            None => tempfile::Builder::new().prefix("clearscan-").tempdir()?,
        };

        self.status.set(root_id, "Downloading archive");
        let archive = self
            .storage
            .download(archive_key, &scratch.path().join("download"))
            .await?;

        self.status.set(root_id, "Extracting archive");
        let extracted = scratch.path().join("extracted");
        extract_tar_gz(&archive, &extracted).await?;

        self.status.set(root_id, "Hashing files");
        let hashes = hash_tree(&extracted, self.config.hash_concurrency).await?;
        let files_total: usize = hashes.values().map(Vec::len).sum();
        if files_total == 0 {
            return Err(ScanError::Archive("archive contains no files".into()));
        }

        self.status.set(root_id, "Checking for previously scanned files");
        let mut needs_scan = Vec::new();
        for (index, package_id) in family.package_ids().into_iter().enumerate() {
            let pending = self.ledger.resolve(package_id, hashes.clone()).await?;
            if index == 0 {
                needs_scan = pending;
            }
        }
        let file_count = u32::try_from(needs_scan.len()).unwrap_or(u32::MAX);
        for job_id in family.job_ids() {
            self.store.set_job_file_count(job_id, file_count).await?;
        }

        if needs_scan.is_empty() {
            self.lifecycle.complete_family(root_id).await?;
            self.status.set(root_id, "All files were already scanned");
            info!(target: "scan::ingest", job_id = %root_id, files_total, "nothing to scan; job completed");
            return Ok(IngestOutcome {
                files_total,
                files_dispatched: 0,
            });
        }

        self.status
            .set(root_id, format!("Uploading {} files for scanning", needs_scan.len()));
        self.upload(&extracted, &needs_scan).await?;

        self.lifecycle.transition(root_id, JobState::Queued).await?;
        self.status.set(root_id, "Submitting files to the scanner");
        let timeout = family.root.timeout_secs.or(self.dispatcher.timeout_secs());
        let files_dispatched = needs_scan.len();
        self.dispatcher.submit(root_id, needs_scan, timeout).await?;
        self.status.set(root_id, "Waiting for the scanner");

        info!(target: "scan::ingest", job_id = %root_id, files_total, files_dispatched, "ingest finished");
        Ok(IngestOutcome {
            files_total,
            files_dispatched,
        })
    }

    async fn upload(&self, root: &Path, files: &[WorkerFile]) -> Result<()> {
        stream::iter(files.iter().cloned())
            .map(|file| {
                let storage = self.storage.clone();
                let local = root.join(&file.path);
                async move {
                    storage.upload_by_hash(&file.hash, &local).await.inspect_err(|err| {
                        warn!(target: "scan::ingest", hash = %file.hash, error = %err, "upload failed");
                    })
                }
            })
            .buffer_unordered(self.config.upload_concurrency.max(1))
            .try_collect::<Vec<()>>()
            .await?;
        Ok(())
    }
}
