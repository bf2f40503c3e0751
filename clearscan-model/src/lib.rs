//! Core data model definitions shared across clearscan crates.
#![allow(missing_docs)]

pub mod alert;
pub mod clearance;
pub mod error;
pub mod files;
pub mod findings;
pub mod ids;
pub mod job;
pub mod package;
pub mod purl;
pub mod queue;
pub mod scan_result;
pub mod worker;

pub use alert::{AlertSeverity, SystemAlert};
pub use clearance::{
    BulkConclusion, ClearanceGroup, LicenseConclusion, PathExclusion,
};
pub use error::{ModelError, Result as ModelResult};
pub use files::{ContentHash, FileRecord, FileScanStatus, FileTree};
pub use findings::{
    CopyrightFinding, LicenseFinding, LicenseMatch, ScanIssue, ScannerConfigKey,
};
pub use ids::{
    BulkConclusionId, ClearanceGroupId, JobId, LicenseConclusionId, PackageId,
    PathExclusionId,
};
pub use job::{JobState, ScannerJob};
pub use package::{Package, PackageScanStatus, PackageSpec};
pub use purl::Purl;
pub use queue::{QueueEvent, QueueEventKind};
pub use scan_result::{
    DetectedCopyright, DetectedMatch, FileScanResult, LicenseDetection,
    ScanResultPayload, ToolMetadata,
};
pub use worker::{
    WorkerFile, WorkerJobOptions, WorkerJobRequest, WorkerJobState,
    WorkerJobStatus,
};
