//! Single-process store used by tests and local development. One mutex over
//! all tables makes every operation atomic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use clearscan_model::{
    AlertSeverity, BulkConclusion, BulkConclusionId, ClearanceGroup,
    ClearanceGroupId, ContentHash, CopyrightFinding, FileRecord,
    FileScanStatus, FileTree, JobId, JobState, LicenseConclusion,
    LicenseConclusionId, LicenseFinding, Package, PackageId,
    PackageScanStatus, PackageSpec, PathExclusion, PathExclusionId, Purl,
    ScanIssue, ScannerJob, SystemAlert,
};

use super::ports::{
    AlertRepository, ClearanceRepository, FileRepository, FindingRepository,
    JobRepository, PackageRepository,
};
use crate::error::{Result, ScanError};

#[derive(Default)]
struct MemoryState {
    packages: HashMap<PackageId, Package>,
    purl_index: HashMap<String, PackageId>,
    files: HashMap<ContentHash, FileRecord>,
    trees: BTreeMap<(PackageId, String), ContentHash>,
    jobs: HashMap<JobId, ScannerJob>,
    children: HashMap<JobId, Vec<JobId>>,
    license_findings: Vec<LicenseFinding>,
    copyright_findings: Vec<CopyrightFinding>,
    scan_issues: Vec<ScanIssue>,
    groups: HashMap<ClearanceGroupId, ClearanceGroup>,
    conclusions: HashMap<LicenseConclusionId, LicenseConclusion>,
    bulk_conclusions: HashMap<BulkConclusionId, BulkConclusion>,
    exclusions: HashMap<PathExclusionId, PathExclusion>,
    alerts: HashMap<String, SystemAlert>,
    #[cfg(test)]
    rejected_jobs: HashSet<JobId>,
}

#[derive(Clone, Default)]
pub struct InMemoryScanStore {
    state: Arc<Mutex<MemoryState>>,
}

impl fmt::Debug for InMemoryScanStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryScanStore");
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("packages", &state.packages.len())
                    .field("files", &state.files.len())
                    .field("file_trees", &state.trees.len())
                    .field("jobs", &state.jobs.len())
                    .field("conclusions", &state.conclusions.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of license conclusions across all packages.
    pub async fn license_conclusion_count(&self) -> usize {
        self.state.lock().await.conclusions.len()
    }

    pub async fn file_count(&self) -> usize {
        self.state.lock().await.files.len()
    }

    pub async fn license_finding_count(&self) -> usize {
        self.state.lock().await.license_findings.len()
    }

    /// Every later job state write that includes `job_id` fails.
    #[cfg(test)]
    pub(crate) async fn reject_writes_for(&self, job_id: JobId) {
        self.state.lock().await.rejected_jobs.insert(job_id);
    }
}

impl MemoryState {
    #[cfg_attr(not(test), allow(unused_variables))]
    fn check_writable(&self, ids: &[JobId]) -> Result<()> {
        #[cfg(test)]
        if let Some(id) = ids.iter().find(|id| self.rejected_jobs.contains(*id)) {
            return Err(ScanError::Internal(format!("write to job {id} rejected")));
        }
        Ok(())
    }

    /// Writes `state` over every listed job whose current state `admit`
    /// accepts. Returns the jobs that changed with their packages.
    fn set_jobs(
        &mut self,
        ids: &[JobId],
        state: JobState,
        failure_message: Option<&str>,
        admit: impl Fn(JobState) -> bool,
    ) -> Vec<(JobId, PackageId)> {
        let now = Utc::now();
        let mut changed = Vec::new();
        for id in ids {
            if let Some(job) = self.jobs.get_mut(id) {
                if !admit(job.state) {
                    continue;
                }
                job.state = state;
                if let Some(message) = failure_message {
                    job.failure_message = Some(message.to_string());
                }
                job.updated_at = now;
                changed.push((job.id, job.package_id));
            }
        }
        changed
    }

    fn set_packages(
        &mut self,
        ids: &[PackageId],
        status: PackageScanStatus,
    ) -> u64 {
        let now = Utc::now();
        let mut touched = 0;
        for id in ids {
            if let Some(package) = self.packages.get_mut(id) {
                package.scan_status = status;
                package.updated_at = now;
                touched += 1;
            }
        }
        touched
    }
}

#[async_trait]
impl PackageRepository for InMemoryScanStore {
    async fn get_package(&self, id: PackageId) -> Result<Option<Package>> {
        Ok(self.state.lock().await.packages.get(&id).cloned())
    }

    async fn find_package_by_purl(
        &self,
        purl: &Purl,
    ) -> Result<Option<Package>> {
        let guard = self.state.lock().await;
        Ok(guard
            .purl_index
            .get(&purl.canonical())
            .and_then(|id| guard.packages.get(id))
            .cloned())
    }

    async fn upsert_package(&self, spec: &PackageSpec) -> Result<Package> {
        let mut guard = self.state.lock().await;
        let key = spec.purl.canonical();
        if let Some(id) = guard.purl_index.get(&key).copied() {
            let package = guard.packages.get_mut(&id).ok_or_else(|| {
                ScanError::Internal(format!("purl index points at missing package {id}"))
            })?;
            if spec.declared_license.is_some() {
                package.declared_license = spec.declared_license.clone();
                package.updated_at = Utc::now();
            }
            return Ok(package.clone());
        }

        let package =
            Package::new(spec.purl.clone(), spec.declared_license.clone());
        guard.purl_index.insert(key, package.id);
        guard.packages.insert(package.id, package.clone());
        Ok(package)
    }

    async fn set_package_status(
        &self,
        ids: &[PackageId],
        status: PackageScanStatus,
    ) -> Result<u64> {
        Ok(self.state.lock().await.set_packages(ids, status))
    }
}

#[async_trait]
impl FileRepository for InMemoryScanStore {
    async fn get_file(&self, hash: &ContentHash) -> Result<Option<FileRecord>> {
        Ok(self.state.lock().await.files.get(hash).cloned())
    }

    async fn insert_file_if_absent(
        &self,
        file: FileRecord,
    ) -> Result<(FileRecord, bool)> {
        let mut guard = self.state.lock().await;
        if let Some(existing) = guard.files.get(&file.hash) {
            return Ok((existing.clone(), false));
        }
        guard.files.insert(file.hash.clone(), file.clone());
        Ok((file, true))
    }

    async fn set_file_status(
        &self,
        hashes: &[ContentHash],
        status: FileScanStatus,
    ) -> Result<u64> {
        let mut guard = self.state.lock().await;
        let now = Utc::now();
        let mut touched = 0;
        for hash in hashes {
            if let Some(file) = guard.files.get_mut(hash) {
                file.scan_status = status;
                file.updated_at = now;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn insert_file_trees(&self, trees: &[FileTree]) -> Result<u64> {
        let mut guard = self.state.lock().await;
        let mut created = 0;
        for tree in trees {
            let key = (tree.package_id, tree.path.clone());
            if !guard.trees.contains_key(&key) {
                guard.trees.insert(key, tree.hash.clone());
                created += 1;
            }
        }
        Ok(created)
    }

    async fn file_trees_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<FileTree>> {
        let guard = self.state.lock().await;
        Ok(guard
            .trees
            .iter()
            .filter(|((pkg, _), _)| *pkg == package_id)
            .map(|((pkg, path), hash)| FileTree::new(*pkg, path.clone(), hash.clone()))
            .collect())
    }

    async fn delete_file_trees_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<ContentHash>> {
        let mut guard = self.state.lock().await;
        let mut removed = Vec::new();
        guard.trees.retain(|(pkg, _), hash| {
            if *pkg == package_id {
                removed.push(hash.clone());
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn count_file_trees_for_hash(&self, hash: &ContentHash) -> Result<u64> {
        let guard = self.state.lock().await;
        Ok(guard.trees.values().filter(|h| *h == hash).count() as u64)
    }

    async fn delete_file(&self, hash: &ContentHash) -> Result<()> {
        let mut guard = self.state.lock().await;
        guard.files.remove(hash);
        guard.license_findings.retain(|f| &f.hash != hash);
        guard.copyright_findings.retain(|f| &f.hash != hash);
        guard.scan_issues.retain(|f| &f.hash != hash);
        Ok(())
    }
}

#[async_trait]
impl JobRepository for InMemoryScanStore {
    async fn insert_jobs(&self, jobs: &[ScannerJob]) -> Result<()> {
        let mut guard = self.state.lock().await;
        for job in jobs {
            if let Some(parent) = job.parent_id {
                let parent_job = guard.jobs.get(&parent).ok_or_else(|| {
                    ScanError::NotFound(format!("parent job {parent}"))
                })?;
                if parent_job.parent_id.is_some() {
                    return Err(ScanError::DataIntegrity(format!(
                        "job {parent} is itself a child and cannot own children"
                    )));
                }
                guard.children.entry(parent).or_default().push(job.id);
            }
            guard.jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<ScannerJob>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn children_of(&self, parent: JobId) -> Result<Vec<ScannerJob>> {
        let guard = self.state.lock().await;
        Ok(guard
            .children
            .get(&parent)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| guard.jobs.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn jobs_in_states(
        &self,
        states: &[JobState],
    ) -> Result<Vec<ScannerJob>> {
        let guard = self.state.lock().await;
        let mut jobs: Vec<ScannerJob> = guard
            .jobs
            .values()
            .filter(|job| states.contains(&job.state))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn jobs_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<ScannerJob>> {
        let guard = self.state.lock().await;
        let mut jobs: Vec<ScannerJob> = guard
            .jobs
            .values()
            .filter(|job| job.package_id == package_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn set_job_states(
        &self,
        ids: &[JobId],
        state: JobState,
        failure_message: Option<&str>,
    ) -> Result<Vec<JobId>> {
        let mut guard = self.state.lock().await;
        guard.check_writable(ids)?;
        let changed =
            guard.set_jobs(ids, state, failure_message, |current| current.moves_to(state));
        Ok(changed.into_iter().map(|(id, _)| id).collect())
    }

    async fn set_job_file_count(
        &self,
        id: JobId,
        file_count: u32,
    ) -> Result<()> {
        let mut guard = self.state.lock().await;
        let job = guard
            .jobs
            .get_mut(&id)
            .ok_or_else(|| ScanError::NotFound(format!("job {id}")))?;
        job.file_count = Some(file_count);
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_jobs(
        &self,
        job_ids: &[JobId],
        message: &str,
    ) -> Result<Vec<JobId>> {
        let mut guard = self.state.lock().await;
        guard.check_writable(job_ids)?;
        let changed = guard.set_jobs(job_ids, JobState::Failed, Some(message), |current| {
            current.moves_to(JobState::Failed)
        });
        let packages: Vec<PackageId> = changed.iter().map(|(_, pkg)| *pkg).collect();
        guard.set_packages(&packages, PackageScanStatus::Failed);
        Ok(changed.into_iter().map(|(id, _)| id).collect())
    }

    async fn complete_jobs(&self, job_ids: &[JobId]) -> Result<Vec<JobId>> {
        let mut guard = self.state.lock().await;
        guard.check_writable(job_ids)?;
        let changed =
            guard.set_jobs(job_ids, JobState::Completed, None, |current| !current.is_final());
        let packages: Vec<PackageId> = changed.iter().map(|(_, pkg)| *pkg).collect();
        guard.set_packages(&packages, PackageScanStatus::Scanned);
        Ok(changed.into_iter().map(|(id, _)| id).collect())
    }
}

#[async_trait]
impl FindingRepository for InMemoryScanStore {
    async fn insert_license_finding(
        &self,
        finding: LicenseFinding,
    ) -> Result<()> {
        self.state.lock().await.license_findings.push(finding);
        Ok(())
    }

    async fn insert_copyright_findings(
        &self,
        findings: Vec<CopyrightFinding>,
    ) -> Result<()> {
        self.state.lock().await.copyright_findings.extend(findings);
        Ok(())
    }

    async fn insert_scan_issues(&self, issues: Vec<ScanIssue>) -> Result<()> {
        self.state.lock().await.scan_issues.extend(issues);
        Ok(())
    }

    async fn license_findings_for(
        &self,
        hashes: &[ContentHash],
    ) -> Result<Vec<LicenseFinding>> {
        let wanted: HashSet<&ContentHash> = hashes.iter().collect();
        let guard = self.state.lock().await;
        Ok(guard
            .license_findings
            .iter()
            .filter(|f| wanted.contains(&f.hash))
            .cloned()
            .collect())
    }

    async fn copyright_findings_for(
        &self,
        hashes: &[ContentHash],
    ) -> Result<Vec<CopyrightFinding>> {
        let wanted: HashSet<&ContentHash> = hashes.iter().collect();
        let guard = self.state.lock().await;
        Ok(guard
            .copyright_findings
            .iter()
            .filter(|f| wanted.contains(&f.hash))
            .cloned()
            .collect())
    }

    async fn scan_issues_for(
        &self,
        hashes: &[ContentHash],
    ) -> Result<Vec<ScanIssue>> {
        let wanted: HashSet<&ContentHash> = hashes.iter().collect();
        let guard = self.state.lock().await;
        Ok(guard
            .scan_issues
            .iter()
            .filter(|f| wanted.contains(&f.hash))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ClearanceRepository for InMemoryScanStore {
    async fn insert_group(&self, group: ClearanceGroup) -> Result<()> {
        self.state.lock().await.groups.insert(group.id, group);
        Ok(())
    }

    async fn insert_license_conclusions(
        &self,
        conclusions: Vec<LicenseConclusion>,
    ) -> Result<u64> {
        let mut guard = self.state.lock().await;
        for conclusion in &conclusions {
            if let Some(group) = conclusion
                .group_ids
                .iter()
                .find(|id| !guard.groups.contains_key(id))
            {
                return Err(ScanError::NotFound(format!(
                    "clearance group {group}"
                )));
            }
        }
        let mut created = 0;
        for conclusion in conclusions {
            if guard
                .conclusions
                .insert(conclusion.id, conclusion)
                .is_none()
            {
                created += 1;
            }
        }
        Ok(created)
    }

    async fn license_conclusions_for_hashes(
        &self,
        hashes: &[ContentHash],
    ) -> Result<Vec<LicenseConclusion>> {
        let wanted: HashSet<&ContentHash> = hashes.iter().collect();
        let guard = self.state.lock().await;
        Ok(guard
            .conclusions
            .values()
            .filter(|c| wanted.contains(&c.hash))
            .cloned()
            .collect())
    }

    async fn license_conclusions_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<LicenseConclusion>> {
        let guard = self.state.lock().await;
        Ok(guard
            .conclusions
            .values()
            .filter(|c| c.package_id == package_id)
            .cloned()
            .collect())
    }

    async fn license_conclusions_for_bulk(
        &self,
        bulk_id: BulkConclusionId,
    ) -> Result<Vec<LicenseConclusion>> {
        let guard = self.state.lock().await;
        Ok(guard
            .conclusions
            .values()
            .filter(|c| c.bulk_conclusion_id == Some(bulk_id))
            .cloned()
            .collect())
    }

    async fn insert_bulk_conclusion(&self, bulk: BulkConclusion) -> Result<()> {
        let mut guard = self.state.lock().await;
        if let Some(group) =
            bulk.group_ids.iter().find(|id| !guard.groups.contains_key(id))
        {
            return Err(ScanError::NotFound(format!("clearance group {group}")));
        }
        guard.bulk_conclusions.insert(bulk.id, bulk);
        Ok(())
    }

    async fn get_bulk_conclusion(
        &self,
        id: BulkConclusionId,
    ) -> Result<Option<BulkConclusion>> {
        Ok(self.state.lock().await.bulk_conclusions.get(&id).cloned())
    }

    async fn bulk_conclusions_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<BulkConclusion>> {
        let guard = self.state.lock().await;
        Ok(guard
            .bulk_conclusions
            .values()
            .filter(|b| b.package_id == package_id)
            .cloned()
            .collect())
    }

    async fn delete_bulk_conclusion(&self, id: BulkConclusionId) -> Result<u64> {
        let mut guard = self.state.lock().await;
        guard.bulk_conclusions.remove(&id);
        let before = guard.conclusions.len();
        guard
            .conclusions
            .retain(|_, c| c.bulk_conclusion_id != Some(id));
        Ok((before - guard.conclusions.len()) as u64)
    }

    async fn insert_path_exclusion(
        &self,
        exclusion: PathExclusion,
    ) -> Result<()> {
        let mut guard = self.state.lock().await;
        if let Some(group) = exclusion
            .group_ids
            .iter()
            .find(|id| !guard.groups.contains_key(id))
        {
            return Err(ScanError::NotFound(format!("clearance group {group}")));
        }
        guard.exclusions.insert(exclusion.id, exclusion);
        Ok(())
    }

    async fn path_exclusions_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<PathExclusion>> {
        let guard = self.state.lock().await;
        Ok(guard
            .exclusions
            .values()
            .filter(|e| e.package_id == package_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AlertRepository for InMemoryScanStore {
    async fn record_alert(
        &self,
        key: &str,
        message: &str,
    ) -> Result<SystemAlert> {
        let mut guard = self.state.lock().await;
        let now = Utc::now();
        let alert = guard
            .alerts
            .entry(key.to_string())
            .and_modify(|alert| {
                alert.occurrences = alert.occurrences.saturating_add(1);
                alert.severity = AlertSeverity::for_occurrences(alert.occurrences);
                alert.message = message.to_string();
                alert.last_seen = now;
            })
            .or_insert_with(|| SystemAlert {
                key: key.to_string(),
                message: message.to_string(),
                severity: AlertSeverity::Low,
                occurrences: 1,
                first_seen: now,
                last_seen: now,
            });
        Ok(alert.clone())
    }

    async fn alerts(&self) -> Result<Vec<SystemAlert>> {
        let guard = self.state.lock().await;
        let mut alerts: Vec<SystemAlert> =
            guard.alerts.values().cloned().collect();
        alerts.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(raw: &str) -> PackageSpec {
        PackageSpec {
            purl: raw.parse().expect("valid purl"),
            declared_license: None,
        }
    }

    #[tokio::test]
    async fn upsert_package_is_keyed_by_canonical_purl() {
        let store = InMemoryScanStore::new();
        let first = store
            .upsert_package(&spec("pkg:npm/left-pad@1.3.0"))
            .await
            .unwrap();
        let second = store
            .upsert_package(&spec("pkg:/npm/left-pad@1.3.0"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.scan_status, PackageScanStatus::NotScanned);
    }

    #[tokio::test]
    async fn child_jobs_cannot_own_children() {
        let store = InMemoryScanStore::new();
        let pkg = store.upsert_package(&spec("pkg:npm/a@1")).await.unwrap();
        let parent = ScannerJob::new(pkg.id, None);
        let child = ScannerJob::new(pkg.id, Some(parent.id));
        let grandchild = ScannerJob::new(pkg.id, Some(child.id));
        store.insert_jobs(&[parent.clone(), child.clone()]).await.unwrap();

        let err = store.insert_jobs(&[grandchild]).await.unwrap_err();
        assert!(matches!(err, ScanError::DataIntegrity(_)));
        assert_eq!(store.children_of(parent.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn alerts_escalate_with_repeated_keys() {
        let store = InMemoryScanStore::new();
        let first = store.record_alert("pkg-1", "interrupted").await.unwrap();
        assert_eq!(first.severity, AlertSeverity::Low);
        store.record_alert("pkg-1", "interrupted").await.unwrap();
        let third = store.record_alert("pkg-1", "interrupted").await.unwrap();
        assert_eq!(third.occurrences, 3);
        assert_eq!(third.severity, AlertSeverity::High);
        assert_eq!(store.alerts().await.unwrap().len(), 1);
    }
}
