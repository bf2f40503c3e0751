//! The scan pipeline: ingest, dispatch, queue sync, reconciliation and
//! results merging, all driving job families through [`JobLifecycle`].

pub mod archive;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod ingest;
pub mod ledger;
pub mod lifecycle;
pub mod merger;
pub mod queue_sync;
pub mod runtime;
pub mod status_board;
pub mod sweeper;

pub use config::{
    DedupConfig, DispatchConfig, EventBusConfig, IngestConfig, MergeConfig, OrchestratorConfig,
    SweeperConfig, WorkerConfig,
};
pub use dispatcher::Dispatcher;
pub use events::{InProcQueueEventBus, QueueEventPublisher, QueueEventStream};
pub use ingest::{IngestCoordinator, IngestOutcome};
pub use ledger::ContentLedger;
pub use lifecycle::{JobFamily, JobLifecycle};
pub use merger::{MergeSummary, ResultsMerger};
pub use queue_sync::QueueEventSync;
pub use runtime::ScanRuntime;
pub use status_board::JobStatusBoard;
pub use sweeper::{ReconciliationSweeper, SweepReport, SweepTracker};
