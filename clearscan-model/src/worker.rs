//! Wire types for the external scanning worker.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::files::ContentHash;
use crate::ids::JobId;
use crate::job::JobState;
use crate::scan_result::ScanResultPayload;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFile {
    pub hash: ContentHash,
    pub path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerJobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u32>,
}

/// Body of `POST /job`. The job id doubles as the queue item id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerJobRequest {
    pub job_id: JobId,
    pub files: Vec<WorkerFile>,
    #[serde(default)]
    pub options: WorkerJobOptions,
}

/// State reported by `GET /job/:id`, plus the locally-observed
/// "could not reach the worker" condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkerJobState {
    Waiting,
    Active,
    Delayed,
    Paused,
    Stalled,
    Completed,
    Failed,
    NotFound,
    #[serde(rename = "noConnectionToSA")]
    NoConnection,
}

impl WorkerJobState {
    /// The job state this worker state corresponds to when adopted into the
    /// job store. `None` for states that are never adopted directly.
    pub fn as_job_state(&self) -> Option<JobState> {
        match self {
            WorkerJobState::Waiting
            | WorkerJobState::Delayed
            | WorkerJobState::Paused => Some(JobState::Waiting),
            WorkerJobState::Active => Some(JobState::Active),
            WorkerJobState::Stalled => Some(JobState::Stalled),
            WorkerJobState::Completed
            | WorkerJobState::Failed
            | WorkerJobState::NotFound
            | WorkerJobState::NoConnection => None,
        }
    }
}

impl fmt::Display for WorkerJobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = match self {
            WorkerJobState::Waiting => "waiting",
            WorkerJobState::Active => "active",
            WorkerJobState::Delayed => "delayed",
            WorkerJobState::Paused => "paused",
            WorkerJobState::Stalled => "stalled",
            WorkerJobState::Completed => "completed",
            WorkerJobState::Failed => "failed",
            WorkerJobState::NotFound => "notFound",
            WorkerJobState::NoConnection => "noConnectionToSA",
        };
        f.write_str(raw)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerJobStatus {
    pub state: WorkerJobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ScanResultPayload>,
}

impl WorkerJobStatus {
    pub fn of(state: WorkerJobState) -> Self {
        Self {
            state,
            failed_reason: None,
            result: None,
        }
    }
}
