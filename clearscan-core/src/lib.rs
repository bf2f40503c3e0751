//! # Clearscan Core
//!
//! Scan orchestration and clearance resolution for source archives.
//!
//! ## Overview
//!
//! - **Ingest and dedup**: archives are extracted and hashed, and only content
//!   that has never been scanned is sent to the external scanner
//! - **Job lifecycle**: parent/child job families move through one state
//!   machine, driven by ingest, queue events and the reconciliation sweeper
//! - **Results merging**: scanner payloads become per-file findings in batches
//! - **Clearance**: curator conclusions and exclusions from several groups are
//!   merged into one effective answer using a caller-supplied ranking
//!
//! ## Feature Flags
//!
//! - `database`: Enables the PostgreSQL store (SQLx) and the bundled migrations
//!
//! ## Architecture
//!
//! - [`database`]: Repository traits plus in-memory and PostgreSQL stores
//! - [`storage`]: Object storage contract and a local filesystem backend
//! - [`worker`]: External scanner contract and its HTTP client
//! - [`orchestration`]: Ingest, dispatch, queue sync, sweeper and merger
//! - [`clearance`]: Bulk conclusions and ranked resolution
//! - [`service`]: The facade called by the outer layers

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod clearance;
pub mod database;

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Error types and error handling utilities
pub mod error;
pub mod orchestration;
pub mod service;
pub mod storage;
pub mod worker;

pub use clearance::{ClearanceCurator, ClearanceResolver, EffectiveClearance};
pub use database::{InMemoryScanStore, ScanStore};
#[cfg(feature = "database")]
pub use database::PostgresScanStore;
pub use error::{Result, ScanError};
pub use orchestration::{
    InProcQueueEventBus, JobLifecycle, JobStatusBoard, OrchestratorConfig, QueueEventSync,
    ReconciliationSweeper, ResultsMerger, ScanRuntime,
};
pub use service::{
    DeletionSummary, JobStateView, ScanFindings, ScanResults, ScanService, SubmitTarget,
};
pub use storage::{LocalObjectStorage, ObjectStorage};
pub use worker::{HttpScanWorker, ScanWorker, WorkerError};
