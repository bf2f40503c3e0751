//! Background supervisor for queue event sync and the reconciliation sweeper.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::orchestration::events::QueueEventStream;
use crate::orchestration::queue_sync::QueueEventSync;
use crate::orchestration::sweeper::{ReconciliationSweeper, SweepTracker};

pub struct ScanRuntime {
    sync: QueueEventSync,
    sweeper: ReconciliationSweeper,
    events: Arc<dyn QueueEventStream>,
    shutdown_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for ScanRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanRuntime")
            .field("sweeper", &self.sweeper)
            .field("cancelled", &self.shutdown_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ScanRuntime {
    pub fn new(
        sync: QueueEventSync,
        sweeper: ReconciliationSweeper,
        events: Arc<dyn QueueEventStream>,
    ) -> Self {
        Self {
            sync,
            sweeper,
            events,
            shutdown_token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Fails jobs interrupted by the previous shutdown, then spawns the
    /// queue sync and sweeper loops.
    pub async fn start(&self) -> Result<()> {
        self.sweeper.recover_on_startup().await?;

        let mut handles = self.handles.lock().await;
        let receiver = self.events.subscribe_queue();
        let sync = self.sync.clone();
        let cancel = self.shutdown_token.clone();
        handles.push(tokio::spawn(async move {
            sync.run(receiver, cancel).await;
        }));
        handles.push(self.spawn_sweeper());
        info!("scan runtime started");
        Ok(())
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let sweeper = self.sweeper.clone();
        let interval = sweeper.config().interval();
        let shutdown = self.shutdown_token.clone();
        tokio::spawn(async move {
            let mut tracker = SweepTracker::new();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!(target: "scan::sweeper", "sweeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = sweeper.sweep(&mut tracker).await {
                            warn!(target: "scan::sweeper", error = %err, "sweep failed");
                        }
                    }
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        info!("shutting down scan runtime");
        self.shutdown_token.cancel();
        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "runtime task panicked"),
                Err(_) => warn!("runtime task did not stop within 30s"),
            }
        }
    }
}
