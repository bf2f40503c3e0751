use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ModelError, Result};
use crate::ids::{JobId, PackageId};

/// Persisted scanner job states.
///
/// `created -> processing -> queued -> {waiting, active, resumed, stalled}
/// -> savingResults -> completed`, with `failed` and `resultsDeleted` as
/// absorbing states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Created,
    Processing,
    Queued,
    Waiting,
    Active,
    Resumed,
    Stalled,
    SavingResults,
    Completed,
    Failed,
    ResultsDeleted,
}

impl JobState {
    pub const NON_FINAL: [JobState; 8] = [
        JobState::Created,
        JobState::Processing,
        JobState::Queued,
        JobState::Waiting,
        JobState::Active,
        JobState::Resumed,
        JobState::Stalled,
        JobState::SavingResults,
    ];

    pub const ALL: [JobState; 11] = [
        JobState::Created,
        JobState::Processing,
        JobState::Queued,
        JobState::Waiting,
        JobState::Active,
        JobState::Resumed,
        JobState::Stalled,
        JobState::SavingResults,
        JobState::Completed,
        JobState::Failed,
        JobState::ResultsDeleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Processing => "processing",
            JobState::Queued => "queued",
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Resumed => "resumed",
            JobState::Stalled => "stalled",
            JobState::SavingResults => "savingResults",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::ResultsDeleted => "resultsDeleted",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::ResultsDeleted
        )
    }

    /// The job never made it onto the worker queue.
    pub fn is_pre_queue(&self) -> bool {
        matches!(self, JobState::Created | JobState::Processing)
    }

    /// States mirrored from worker queue lifecycle events.
    pub fn is_queue_state(&self) -> bool {
        matches!(
            self,
            JobState::Queued
                | JobState::Waiting
                | JobState::Active
                | JobState::Resumed
                | JobState::Stalled
        )
    }

    /// Whether a write of `next` over `self` is a legal transition. Setting a
    /// job to the state it already has is always legal so that repeated
    /// "set to known state" writes stay idempotent.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if *self == next {
            return true;
        }
        match next {
            JobState::ResultsDeleted => true,
            JobState::Failed => !self.is_final(),
            JobState::Created => false,
            JobState::Processing => matches!(self, JobState::Created),
            JobState::Queued => matches!(self, JobState::Processing),
            JobState::Waiting
            | JobState::Active
            | JobState::Resumed
            | JobState::Stalled => {
                matches!(self, JobState::Processing) || self.is_queue_state()
            }
            JobState::SavingResults => {
                matches!(self, JobState::Processing) || self.is_queue_state()
            }
            JobState::Completed => matches!(
                self,
                JobState::SavingResults | JobState::Processing
            ),
        }
    }

    /// Whether writing `next` over `self` changes the row. Stores apply this
    /// check inside the write itself.
    pub fn moves_to(&self, next: JobState) -> bool {
        *self != next && self.can_transition_to(next)
    }

    /// Every state a write of `target` may land on.
    pub fn sources_of(target: JobState) -> Vec<JobState> {
        JobState::ALL
            .into_iter()
            .filter(|state| state.moves_to(target))
            .collect()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "created" => JobState::Created,
            "processing" => JobState::Processing,
            "queued" => JobState::Queued,
            "waiting" => JobState::Waiting,
            "active" => JobState::Active,
            "resumed" => JobState::Resumed,
            "stalled" => JobState::Stalled,
            "savingResults" => JobState::SavingResults,
            "completed" => JobState::Completed,
            "failed" => JobState::Failed,
            "resultsDeleted" => JobState::ResultsDeleted,
            other => return Err(ModelError::UnknownState(other.to_string())),
        })
    }
}

/// Durable record of a scan job. Children (`parent_id = Some(..)`) never have
/// children of their own.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannerJob {
    pub id: JobId,
    pub package_id: PackageId,
    pub parent_id: Option<JobId>,
    pub state: JobState,
    pub file_count: Option<u32>,
    pub timeout_secs: Option<u32>,
    pub failure_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScannerJob {
    pub fn new(package_id: PackageId, parent_id: Option<JobId>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            package_id,
            parent_id,
            state: JobState::Created,
            file_count: None,
            timeout_secs: None,
            failure_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_child(&self) -> bool {
        self.parent_id.is_some()
    }
}
