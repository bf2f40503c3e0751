use std::sync::Arc;

use dashmap::DashMap;

use clearscan_model::JobId;

/// Latest human-readable progress message per job. Process-local; the
/// persisted job state stays the source of truth.
#[derive(Clone, Debug, Default)]
pub struct JobStatusBoard {
    messages: Arc<DashMap<JobId, String>>,
}

impl JobStatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, job_id: JobId, message: impl Into<String>) {
        self.messages.insert(job_id, message.into());
    }

    pub fn get(&self, job_id: JobId) -> Option<String> {
        self.messages.get(&job_id).map(|entry| entry.value().clone())
    }

    pub fn clear(&self, job_id: JobId) {
        self.messages.remove(&job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_message_wins() {
        let board = JobStatusBoard::new();
        let id = JobId::new();
        board.set(id, "Downloading archive");
        board.set(id, "Hashing 12 files");
        assert_eq!(board.get(id).as_deref(), Some("Hashing 12 files"));
        board.clear(id);
        assert!(board.get(id).is_none());
    }
}
