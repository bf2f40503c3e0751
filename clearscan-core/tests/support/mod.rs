//! Shared fixtures for the engine integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use clearscan_core::database::ScanStore;
use clearscan_core::orchestration::{JobStatusBoard, OrchestratorConfig};
use clearscan_core::worker::{ScanWorker, WorkerError};
use clearscan_core::{InMemoryScanStore, LocalObjectStorage, ScanService};
use clearscan_model::{
    ContentHash, DetectedMatch, FileScanResult, JobId, LicenseDetection, ScanResultPayload,
    ToolMetadata, WorkerJobRequest, WorkerJobState, WorkerJobStatus,
};

/// In-process scanner that records submissions and answers status lookups
/// from a table the test controls.
#[derive(Debug, Default)]
pub struct FakeWorker {
    submissions: Mutex<Vec<WorkerJobRequest>>,
    statuses: Mutex<HashMap<JobId, WorkerJobStatus>>,
    fallback: Mutex<Option<WorkerJobState>>,
    refuse_submissions: Mutex<bool>,
}

impl FakeWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submissions(&self) -> Vec<WorkerJobRequest> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn set_status(&self, job_id: JobId, status: WorkerJobStatus) {
        self.statuses.lock().unwrap().insert(job_id, status);
    }

    pub fn set_state(&self, job_id: JobId, state: WorkerJobState) {
        self.set_status(job_id, WorkerJobStatus::of(state));
    }

    /// Every later submission is recorded, then refused as if the worker
    /// were down.
    pub fn refuse_submissions(&self) {
        *self.refuse_submissions.lock().unwrap() = true;
    }

    /// State reported for jobs without an explicit entry.
    pub fn set_fallback(&self, state: WorkerJobState) {
        *self.fallback.lock().unwrap() = Some(state);
    }
}

#[async_trait]
impl ScanWorker for FakeWorker {
    async fn submit(&self, request: &WorkerJobRequest) -> Result<(), WorkerError> {
        self.submissions.lock().unwrap().push(request.clone());
        if *self.refuse_submissions.lock().unwrap() {
            return Err(WorkerError::Unreachable("connection refused".into()));
        }
        self.statuses
            .lock()
            .unwrap()
            .entry(request.job_id)
            .or_insert_with(|| WorkerJobStatus::of(WorkerJobState::Waiting));
        Ok(())
    }

    async fn job_status(&self, job_id: JobId) -> Result<WorkerJobStatus, WorkerError> {
        if let Some(status) = self.statuses.lock().unwrap().get(&job_id) {
            return Ok(status.clone());
        }
        let fallback = self
            .fallback
            .lock()
            .unwrap()
            .unwrap_or(WorkerJobState::NotFound);
        Ok(WorkerJobStatus::of(fallback))
    }
}

pub fn sha(bytes: &[u8]) -> ContentHash {
    ContentHash::parse(hex::encode(Sha256::digest(bytes))).unwrap()
}

pub fn write_tar_gz(target: &Path, files: &[(&str, &[u8])]) {
    let gz = GzEncoder::new(File::create(target).unwrap(), Compression::fast());
    let mut builder = tar::Builder::new(gz);
    for (path, bytes) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, *bytes).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
}

/// Scanner payload reporting `license` for every listed file.
pub fn payload(files: &[(&str, &[u8])], license: &str) -> ScanResultPayload {
    ScanResultPayload {
        tool: ToolMetadata {
            name: "scancode".into(),
            version: "32.0.8".into(),
            options: "--license --copyright".into(),
        },
        files: files
            .iter()
            .map(|(path, bytes)| FileScanResult {
                path: path.to_string(),
                sha256: sha(bytes),
                detected_license_expression: Some(license.to_string()),
                license_detections: vec![LicenseDetection {
                    license_expression: license.to_string(),
                    matches: vec![DetectedMatch {
                        license_expression: license.to_string(),
                        score: 100.0,
                        start_line: 1,
                        end_line: 1,
                    }],
                }],
                copyrights: Vec::new(),
                scan_errors: Vec::new(),
            })
            .collect(),
    }
}

pub struct Harness {
    pub store: InMemoryScanStore,
    pub storage: Arc<LocalObjectStorage>,
    pub worker: Arc<FakeWorker>,
    pub status: JobStatusBoard,
    pub service: ScanService,
    pub config: OrchestratorConfig,
    dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(OrchestratorConfig::default()).await
    }

    pub async fn with_config(mut config: OrchestratorConfig) -> Self {
        let dir = TempDir::new().unwrap();
        config.ingest.work_dir = Some(dir.path().join("work"));
        let store = InMemoryScanStore::new();
        let storage = Arc::new(
            LocalObjectStorage::new(dir.path().join("objects"))
                .await
                .unwrap(),
        );
        let worker = Arc::new(FakeWorker::new());
        let status = JobStatusBoard::new();
        let service = ScanService::new(
            Arc::new(store.clone()),
            storage.clone(),
            worker.clone(),
            status.clone(),
            &config,
        );
        Self {
            store,
            storage,
            worker,
            status,
            service,
            config,
            dir,
        }
    }

    pub fn store_handle(&self) -> Arc<dyn ScanStore> {
        Arc::new(self.store.clone())
    }

    /// Stores a tarball of `files` under `key` in object storage.
    pub async fn upload_archive(&self, key: &str, files: &[(&str, &[u8])]) {
        let local = self.dir.path().join(format!("{}.tar.gz", key.replace('/', "_")));
        write_tar_gz(&local, files);
        let bytes = std::fs::read(&local).unwrap();
        self.storage.put_bytes(key, &bytes).await.unwrap();
    }
}
