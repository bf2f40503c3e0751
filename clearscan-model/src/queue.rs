use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::JobId;
use crate::job::JobState;
use crate::scan_result::ScanResultPayload;

/// Lifecycle notification published by the worker queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum QueueEventKind {
    Waiting,
    Active,
    Resumed,
    Stalled,
    Failed {
        #[serde(default)]
        reason: Option<String>,
    },
    Completed {
        #[serde(default)]
        result: Option<Box<ScanResultPayload>>,
    },
}

impl QueueEventKind {
    /// Job state the event drives the job family into.
    pub fn target_state(&self) -> JobState {
        match self {
            QueueEventKind::Waiting => JobState::Waiting,
            QueueEventKind::Active => JobState::Active,
            QueueEventKind::Resumed => JobState::Resumed,
            QueueEventKind::Stalled => JobState::Stalled,
            QueueEventKind::Failed { .. } => JobState::Failed,
            QueueEventKind::Completed { .. } => JobState::SavingResults,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            QueueEventKind::Waiting => "waiting",
            QueueEventKind::Active => "active",
            QueueEventKind::Resumed => "resumed",
            QueueEventKind::Stalled => "stalled",
            QueueEventKind::Failed { .. } => "failed",
            QueueEventKind::Completed { .. } => "completed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEvent {
    pub job_id: JobId,
    #[serde(flatten)]
    pub kind: QueueEventKind,
}

impl QueueEvent {
    pub fn new(job_id: JobId, kind: QueueEventKind) -> Self {
        Self { job_id, kind }
    }
}

impl fmt::Display for QueueEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.job_id, self.kind.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_flat_json_events() {
        let id = JobId::new();
        let raw = format!(
            r#"{{"jobId":"{id}","event":"failed","reason":"timeout"}}"#
        );
        let event: QueueEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(event.job_id, id);
        assert_eq!(
            event.kind,
            QueueEventKind::Failed {
                reason: Some("timeout".into())
            }
        );

        let raw = format!(r#"{{"jobId":"{id}","event":"active"}}"#);
        let event: QueueEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(event.kind.target_state(), JobState::Active);
    }
}
