//! Query contract consumed by the engine. Every multi-row state write is a
//! single atomic operation in each implementation.

use async_trait::async_trait;

use clearscan_model::{
    BulkConclusion, BulkConclusionId, ClearanceGroup, ContentHash,
    CopyrightFinding, FileRecord, FileScanStatus, FileTree, JobId, JobState,
    LicenseConclusion, LicenseFinding, Package, PackageId, PackageScanStatus,
    PackageSpec, PathExclusion, Purl, ScanIssue, ScannerJob, SystemAlert,
};

use crate::error::Result;

#[async_trait]
pub trait PackageRepository: Send + Sync {
    async fn get_package(&self, id: PackageId) -> Result<Option<Package>>;

    async fn find_package_by_purl(&self, purl: &Purl)
    -> Result<Option<Package>>;

    /// Returns the package for `spec.purl`, creating it as `notScanned` when
    /// missing. A declared license on the spec overwrites the stored one.
    async fn upsert_package(&self, spec: &PackageSpec) -> Result<Package>;

    async fn set_package_status(
        &self,
        ids: &[PackageId],
        status: PackageScanStatus,
    ) -> Result<u64>;
}

#[async_trait]
pub trait FileRepository: Send + Sync {
    async fn get_file(&self, hash: &ContentHash) -> Result<Option<FileRecord>>;

    /// Inserts the file unless a row with the same hash exists. Returns the
    /// stored row and whether this call created it.
    async fn insert_file_if_absent(
        &self,
        file: FileRecord,
    ) -> Result<(FileRecord, bool)>;

    async fn set_file_status(
        &self,
        hashes: &[ContentHash],
        status: FileScanStatus,
    ) -> Result<u64>;

    /// Inserts file tree rows, skipping `(package, path)` pairs that already
    /// exist. Returns the number of rows created.
    async fn insert_file_trees(&self, trees: &[FileTree]) -> Result<u64>;

    async fn file_trees_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<FileTree>>;

    /// Removes every file tree of the package and returns the hashes they
    /// pointed at.
    async fn delete_file_trees_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<ContentHash>>;

    async fn count_file_trees_for_hash(&self, hash: &ContentHash) -> Result<u64>;

    /// Deletes the file row and every finding keyed by it. License
    /// conclusions on the hash are curator data and stay.
    async fn delete_file(&self, hash: &ContentHash) -> Result<()>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert_jobs(&self, jobs: &[ScannerJob]) -> Result<()>;

    async fn get_job(&self, id: JobId) -> Result<Option<ScannerJob>>;

    async fn children_of(&self, parent: JobId) -> Result<Vec<ScannerJob>>;

    async fn jobs_in_states(&self, states: &[JobState])
    -> Result<Vec<ScannerJob>>;

    async fn jobs_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<ScannerJob>>;

    /// Sets every listed job whose current state may legally move to
    /// `state`, checked inside the write. Jobs already there or unable to
    /// move are skipped. `failure_message` is stored when given. Returns the
    /// ids that changed.
    async fn set_job_states(
        &self,
        ids: &[JobId],
        state: JobState,
        failure_message: Option<&str>,
    ) -> Result<Vec<JobId>>;

    async fn set_job_file_count(&self, id: JobId, file_count: u32)
    -> Result<()>;

    /// Non-final jobs to `failed` with the message and their packages to
    /// `failed`, together. Returns the ids that changed.
    async fn fail_jobs(&self, job_ids: &[JobId], message: &str)
    -> Result<Vec<JobId>>;

    /// Non-final jobs to `completed` and their packages to `scanned`,
    /// together. Returns the ids that changed.
    async fn complete_jobs(&self, job_ids: &[JobId]) -> Result<Vec<JobId>>;
}

#[async_trait]
pub trait FindingRepository: Send + Sync {
    async fn insert_license_finding(&self, finding: LicenseFinding) -> Result<()>;

    async fn insert_copyright_findings(
        &self,
        findings: Vec<CopyrightFinding>,
    ) -> Result<()>;

    async fn insert_scan_issues(&self, issues: Vec<ScanIssue>) -> Result<()>;

    async fn license_findings_for(
        &self,
        hashes: &[ContentHash],
    ) -> Result<Vec<LicenseFinding>>;

    async fn copyright_findings_for(
        &self,
        hashes: &[ContentHash],
    ) -> Result<Vec<CopyrightFinding>>;

    async fn scan_issues_for(
        &self,
        hashes: &[ContentHash],
    ) -> Result<Vec<ScanIssue>>;
}

#[async_trait]
pub trait ClearanceRepository: Send + Sync {
    async fn insert_group(&self, group: ClearanceGroup) -> Result<()>;

    async fn insert_license_conclusions(
        &self,
        conclusions: Vec<LicenseConclusion>,
    ) -> Result<u64>;

    async fn license_conclusions_for_hashes(
        &self,
        hashes: &[ContentHash],
    ) -> Result<Vec<LicenseConclusion>>;

    async fn license_conclusions_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<LicenseConclusion>>;

    async fn license_conclusions_for_bulk(
        &self,
        bulk_id: BulkConclusionId,
    ) -> Result<Vec<LicenseConclusion>>;

    async fn insert_bulk_conclusion(&self, bulk: BulkConclusion) -> Result<()>;

    async fn get_bulk_conclusion(
        &self,
        id: BulkConclusionId,
    ) -> Result<Option<BulkConclusion>>;

    async fn bulk_conclusions_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<BulkConclusion>>;

    /// Deletes the bulk conclusion and every conclusion generated from it.
    /// Returns how many generated conclusions were removed.
    async fn delete_bulk_conclusion(&self, id: BulkConclusionId) -> Result<u64>;

    async fn insert_path_exclusion(&self, exclusion: PathExclusion) -> Result<()>;

    async fn path_exclusions_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<PathExclusion>>;
}

#[async_trait]
pub trait AlertRepository: Send + Sync {
    /// Upserts the alert for `key`, bumping its occurrence count.
    async fn record_alert(&self, key: &str, message: &str) -> Result<SystemAlert>;

    async fn alerts(&self) -> Result<Vec<SystemAlert>>;
}

/// Everything the engine needs from persistence.
pub trait ScanStore:
    PackageRepository
    + FileRepository
    + JobRepository
    + FindingRepository
    + ClearanceRepository
    + AlertRepository
{
}

impl<T> ScanStore for T where
    T: PackageRepository
        + FileRepository
        + JobRepository
        + FindingRepository
        + ClearanceRepository
        + AlertRepository
{
}
