use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs for every pipeline component.
///
/// All fields carry defaults so a deployment only needs to spell out what it
/// changes.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub ingest: IngestConfig,
    pub dedup: DedupConfig,
    pub dispatch: DispatchConfig,
    pub merge: MergeConfig,
    pub sweeper: SweeperConfig,
    pub worker: WorkerConfig,
    pub events: EventBusConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Parallel hash computations while walking an extracted archive.
    pub hash_concurrency: usize,
    /// Parallel uploads of files that need scanning.
    pub upload_concurrency: usize,
    /// Parent directory for per-job scratch space. Falls back to the system
    /// temp dir when unset.
    pub work_dir: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            hash_concurrency: 10,
            upload_concurrency: 10,
            work_dir: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub concurrency: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self { concurrency: 10 }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Total submission attempts, including the first.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub retry_delay_ms: u64,
    /// Per-job scan timeout forwarded to the worker.
    pub job_timeout_secs: Option<u32>,
}

impl DispatchConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 1_000,
            job_timeout_secs: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Files per batch; batches run strictly one after another.
    pub batch_size: usize,
    /// Parallel file writes within one batch.
    pub concurrency: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            concurrency: 10,
        }
    }
}

/// Reconciliation cadence and the number of consecutive observations each
/// discrepancy needs before it is acted on.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    pub created_threshold: u32,
    pub processing_threshold: u32,
    pub not_found_threshold: u32,
    pub unreachable_threshold: u32,
    pub drift_threshold: u32,
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3_600,
            created_threshold: 2,
            processing_threshold: 7,
            not_found_threshold: 2,
            unreachable_threshold: 3,
            drift_threshold: 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub request_timeout_secs: u64,
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            token: None,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Broadcast buffer; slow subscribers past this many events lag.
    pub capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self { capacity: 1_024 }
    }
}
