//! Persists a completed scan payload and closes out the job family.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use futures::{StreamExt, TryStreamExt, stream};
use tracing::{error, info, instrument};

use clearscan_model::{
    CopyrightFinding, FileRecord, FileScanResult, FileScanStatus, FileTree, JobId, JobState,
    LicenseFinding, LicenseMatch, PackageId, ScanIssue, ScanResultPayload, ScannerConfigKey,
};

use crate::database::ScanStore;
use crate::error::{Result, ScanError};
use crate::orchestration::config::MergeConfig;
use crate::orchestration::lifecycle::JobLifecycle;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub files_saved: usize,
    /// Files whose content was already scanned; their findings are kept.
    pub files_skipped: usize,
}

#[derive(Clone)]
pub struct ResultsMerger {
    store: Arc<dyn ScanStore>,
    lifecycle: JobLifecycle,
    config: MergeConfig,
}

impl fmt::Debug for ResultsMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultsMerger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

enum FileOutcome {
    Saved,
    Skipped,
}

impl ResultsMerger {
    pub fn new(store: Arc<dyn ScanStore>, config: MergeConfig) -> Self {
        let lifecycle = JobLifecycle::new(store.clone());
        Self {
            store,
            lifecycle,
            config,
        }
    }

    /// Any error demotes the family to `failed` once, then is returned as is.
    #[instrument(target = "scan::merge", skip(self, payload), fields(files = payload.files.len()))]
    pub async fn merge(&self, job_id: JobId, payload: &ScanResultPayload) -> Result<MergeSummary> {
        match self.save(job_id, payload).await {
            Ok(summary) => Ok(summary),
            Err(err) => {
                error!(target: "scan::merge", %job_id, error = %err, "saving scan results failed");
                self.lifecycle
                    .fail_best_effort(job_id, &format!("Saving scan results failed: {err}"))
                    .await;
                Err(err)
            }
        }
    }

    async fn save(&self, job_id: JobId, payload: &ScanResultPayload) -> Result<MergeSummary> {
        self.lifecycle.transition(job_id, JobState::SavingResults).await?;
        let family = self.lifecycle.family(job_id).await?;
        let package_id = family.root.package_id;
        let scanner = ScannerConfigKey {
            scanner: payload.tool.name.clone(),
            version: payload.tool.version.clone(),
            config: payload.tool.options.clone(),
        };

        let mut summary = MergeSummary::default();
        for (index, batch) in payload.files.chunks(self.config.batch_size.max(1)).enumerate() {
            let outcomes: Vec<FileOutcome> = stream::iter(batch.iter().cloned())
                .map(|file| {
                    let this = self.clone();
                    let scanner = scanner.clone();
                    async move { this.save_file(package_id, &scanner, &file).await }
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .try_collect()
                .await?;
            for outcome in outcomes {
                match outcome {
                    FileOutcome::Saved => summary.files_saved += 1,
                    FileOutcome::Skipped => summary.files_skipped += 1,
                }
            }
            info!(target: "scan::merge", %job_id, batch = index + 1, files = batch.len(), "batch saved");
        }

        self.lifecycle.complete_family(job_id).await?;
        info!(
            target: "scan::merge",
            %job_id,
            saved = summary.files_saved,
            skipped = summary.files_skipped,
            "scan results saved"
        );
        Ok(summary)
    }

    async fn save_file(
        &self,
        package_id: PackageId,
        scanner: &ScannerConfigKey,
        file: &FileScanResult,
    ) -> Result<FileOutcome> {
        if file.detected_license_expression.is_some() && file.match_count() == 0 {
            return Err(ScanError::DataIntegrity(format!(
                "`{}` has a detected license expression but no license matches",
                file.path
            )));
        }

        let (record, _) = self
            .store
            .insert_file_if_absent(FileRecord::new(file.sha256.clone()))
            .await?;
        self.store
            .insert_file_trees(&[FileTree::new(package_id, file.path.clone(), file.sha256.clone())])
            .await?;
        if record.scan_status == FileScanStatus::Scanned {
            return Ok(FileOutcome::Skipped);
        }

        let now = Utc::now();
        if let Some(expression) = &file.detected_license_expression {
            let matches = file
                .license_detections
                .iter()
                .flat_map(|detection| detection.matches.iter())
                .map(|m| LicenseMatch {
                    license_expression: m.license_expression.clone(),
                    score: m.score,
                    start_line: m.start_line,
                    end_line: m.end_line,
                })
                .collect();
            self.store
                .insert_license_finding(LicenseFinding {
                    hash: file.sha256.clone(),
                    scanner: scanner.clone(),
                    license_expression: expression.clone(),
                    matches,
                    created_at: now,
                })
                .await?;
        }

        let copyrights = file
            .copyrights
            .iter()
            .map(|c| CopyrightFinding {
                hash: file.sha256.clone(),
                scanner: scanner.clone(),
                copyright: c.copyright.clone(),
                start_line: c.start_line,
                end_line: c.end_line,
                created_at: now,
            })
            .collect();
        self.store.insert_copyright_findings(copyrights).await?;

        let issues = file
            .scan_errors
            .iter()
            .map(|message| ScanIssue {
                hash: file.sha256.clone(),
                scanner: scanner.clone(),
                message: message.clone(),
                created_at: now,
            })
            .collect();
        self.store.insert_scan_issues(issues).await?;

        self.store
            .set_file_status(std::slice::from_ref(&file.sha256), FileScanStatus::Scanned)
            .await?;
        Ok(FileOutcome::Saved)
    }
}
