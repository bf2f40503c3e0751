//! Postgres-backed scan store.
//!
//! Enum-like columns are stored as their camelCase names so rows stay
//! readable from psql. Multi-row state changes run inside one transaction.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use clearscan_model::{
    AlertSeverity, BulkConclusion, BulkConclusionId, ClearanceGroup,
    ClearanceGroupId, ContentHash, CopyrightFinding, FileRecord,
    FileScanStatus, FileTree, JobId, JobState, LicenseConclusion,
    LicenseFinding, LicenseMatch, Package, PackageId, PackageScanStatus,
    PackageSpec, PathExclusion, Purl, ScanIssue, ScannerConfigKey, ScannerJob,
    SystemAlert,
};

use super::ports::{
    AlertRepository, ClearanceRepository, FileRepository, FindingRepository,
    JobRepository, PackageRepository,
};
use crate::error::{Result, ScanError};

#[derive(Clone)]
pub struct PostgresScanStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresScanStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresScanStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

const JOB_COLUMNS: &str = "id, package_id, parent_id, state, file_count, \
     timeout_secs, failure_message, created_at, updated_at";

const CONCLUSION_SELECT: &str = r#"
    SELECT c.id, c.hash, c.package_id, c.detected_expression,
           c.concluded_expression, c.comment, c.bulk_conclusion_id,
           c.curator, c.created_at,
           ARRAY(SELECT g.group_id FROM license_conclusion_groups g
                 WHERE g.item_id = c.id) AS group_ids
    FROM license_conclusions c
"#;

const BULK_SELECT: &str = r#"
    SELECT b.id, b.package_id, b.pattern, b.detected_expression,
           b.concluded_expression, b.comment, b.curator, b.created_at,
           ARRAY(SELECT g.group_id FROM bulk_conclusion_groups g
                 WHERE g.item_id = b.id) AS group_ids
    FROM bulk_conclusions b
"#;

impl PostgresScanStore {
    /// Wraps the pool after a health check. Run [`crate::MIGRATOR`] first.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                ScanError::Internal(format!(
                    "scan store failed Postgres health check: {e}"
                ))
            })?;
        info!("Scan store connected to Postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn job_ids(ids: &[JobId]) -> Vec<Uuid> {
    ids.iter().map(JobId::as_uuid).collect()
}

fn package_ids(ids: &[PackageId]) -> Vec<Uuid> {
    ids.iter().map(PackageId::as_uuid).collect()
}

fn state_names(states: &[JobState]) -> Vec<&'static str> {
    states.iter().map(JobState::as_str).collect()
}

/// Splits `RETURNING id, package_id` rows of a job update.
fn changed_jobs(rows: &[PgRow]) -> Result<(Vec<JobId>, Vec<Uuid>)> {
    let mut jobs = Vec::with_capacity(rows.len());
    let mut packages = Vec::with_capacity(rows.len());
    for row in rows {
        jobs.push(JobId(row.try_get("id")?));
        packages.push(row.try_get::<Uuid, _>("package_id")?);
    }
    Ok((jobs, packages))
}

fn hash_strings(hashes: &[ContentHash]) -> Vec<String> {
    hashes.iter().map(|h| h.as_str().to_string()).collect()
}

fn group_uuids(ids: &[ClearanceGroupId]) -> Vec<Uuid> {
    ids.iter().map(ClearanceGroupId::as_uuid).collect()
}

fn opt_u32(value: Option<i32>) -> Option<u32> {
    value.and_then(|v| u32::try_from(v).ok())
}

fn package_from_row(row: &PgRow) -> Result<Package> {
    let purl: String = row.try_get("purl")?;
    let status: String = row.try_get("scan_status")?;
    Ok(Package {
        id: PackageId(row.try_get("id")?),
        purl: purl.parse::<Purl>()?,
        scan_status: status.parse()?,
        declared_license: row.try_get("declared_license")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn file_from_row(row: &PgRow) -> Result<FileRecord> {
    let hash: String = row.try_get("hash")?;
    let status: String = row.try_get("scan_status")?;
    Ok(FileRecord {
        hash: ContentHash::parse(hash)?,
        scan_status: status.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<ScannerJob> {
    let state: String = row.try_get("state")?;
    let parent: Option<Uuid> = row.try_get("parent_id")?;
    Ok(ScannerJob {
        id: JobId(row.try_get("id")?),
        package_id: PackageId(row.try_get("package_id")?),
        parent_id: parent.map(JobId),
        state: state.parse()?,
        file_count: opt_u32(row.try_get("file_count")?),
        timeout_secs: opt_u32(row.try_get("timeout_secs")?),
        failure_message: row.try_get("failure_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn scanner_from_row(row: &PgRow) -> Result<ScannerConfigKey> {
    Ok(ScannerConfigKey {
        scanner: row.try_get("scanner")?,
        version: row.try_get("scanner_version")?,
        config: row.try_get("scanner_config")?,
    })
}

fn groups_from_row(row: &PgRow) -> Result<Vec<ClearanceGroupId>> {
    let ids: Vec<Uuid> = row.try_get("group_ids")?;
    Ok(ids.into_iter().map(ClearanceGroupId).collect())
}

fn conclusion_from_row(row: &PgRow) -> Result<LicenseConclusion> {
    let hash: String = row.try_get("hash")?;
    let bulk: Option<Uuid> = row.try_get("bulk_conclusion_id")?;
    Ok(LicenseConclusion {
        id: row.try_get::<Uuid, _>("id")?.into(),
        hash: ContentHash::parse(hash)?,
        package_id: PackageId(row.try_get("package_id")?),
        detected_expression: row.try_get("detected_expression")?,
        concluded_expression: row.try_get("concluded_expression")?,
        comment: row.try_get("comment")?,
        bulk_conclusion_id: bulk.map(BulkConclusionId),
        curator: row.try_get("curator")?,
        group_ids: groups_from_row(row)?,
        created_at: row.try_get("created_at")?,
    })
}

fn bulk_from_row(row: &PgRow) -> Result<BulkConclusion> {
    Ok(BulkConclusion {
        id: BulkConclusionId(row.try_get("id")?),
        package_id: PackageId(row.try_get("package_id")?),
        pattern: row.try_get("pattern")?,
        detected_expression: row.try_get("detected_expression")?,
        concluded_expression: row.try_get("concluded_expression")?,
        comment: row.try_get("comment")?,
        curator: row.try_get("curator")?,
        group_ids: groups_from_row(row)?,
        created_at: row.try_get("created_at")?,
    })
}

async fn link_groups(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: &str,
    item_id: Uuid,
    groups: &[ClearanceGroupId],
) -> Result<()> {
    if groups.is_empty() {
        return Ok(());
    }
    let missing: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM UNNEST($1::uuid[]) AS wanted(id) \
         WHERE NOT EXISTS (SELECT 1 FROM clearance_groups g WHERE g.id = wanted.id)",
    )
    .bind(group_uuids(groups))
    .fetch_one(&mut **tx)
    .await?;
    if missing > 0 {
        return Err(ScanError::NotFound(format!(
            "{missing} clearance group(s) referenced by {item_id}"
        )));
    }
    let sql = format!(
        "INSERT INTO {table} (item_id, group_id) \
         SELECT $1, UNNEST($2::uuid[]) ON CONFLICT DO NOTHING"
    );
    sqlx::query(&sql)
        .bind(item_id)
        .bind(group_uuids(groups))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl PackageRepository for PostgresScanStore {
    async fn get_package(&self, id: PackageId) -> Result<Option<Package>> {
        let row = sqlx::query("SELECT * FROM packages WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(package_from_row).transpose()
    }

    async fn find_package_by_purl(
        &self,
        purl: &Purl,
    ) -> Result<Option<Package>> {
        let row = sqlx::query("SELECT * FROM packages WHERE purl = $1")
            .bind(purl.canonical())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(package_from_row).transpose()
    }

    async fn upsert_package(&self, spec: &PackageSpec) -> Result<Package> {
        let fresh = Package::new(spec.purl.clone(), spec.declared_license.clone());
        let row = sqlx::query(
            r#"
            INSERT INTO packages (id, purl, scan_status, declared_license, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $5)
            ON CONFLICT (purl) DO UPDATE SET
                declared_license = COALESCE(EXCLUDED.declared_license, packages.declared_license),
                updated_at = CASE
                    WHEN EXCLUDED.declared_license IS NULL THEN packages.updated_at
                    ELSE NOW()
                END
            RETURNING *
            "#,
        )
        .bind(fresh.id.as_uuid())
        .bind(fresh.purl.canonical())
        .bind(fresh.scan_status.as_str())
        .bind(fresh.declared_license.as_deref())
        .bind(fresh.created_at)
        .fetch_one(&self.pool)
        .await?;
        package_from_row(&row)
    }

    async fn set_package_status(
        &self,
        ids: &[PackageId],
        status: PackageScanStatus,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE packages SET scan_status = $2, updated_at = NOW() WHERE id = ANY($1)",
        )
        .bind(package_ids(ids))
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl FileRepository for PostgresScanStore {
    async fn get_file(&self, hash: &ContentHash) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE hash = $1")
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    async fn insert_file_if_absent(
        &self,
        file: FileRecord,
    ) -> Result<(FileRecord, bool)> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO files (hash, scan_status, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (hash) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(file.hash.as_str())
        .bind(file.scan_status.as_str())
        .bind(file.created_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((file_from_row(&row)?, true));
        }
        let existing = self.get_file(&file.hash).await?.ok_or_else(|| {
            ScanError::Internal(format!("file {} vanished during insert", file.hash))
        })?;
        Ok((existing, false))
    }

    async fn set_file_status(
        &self,
        hashes: &[ContentHash],
        status: FileScanStatus,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE files SET scan_status = $2, updated_at = NOW() WHERE hash = ANY($1)",
        )
        .bind(hash_strings(hashes))
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_file_trees(&self, trees: &[FileTree]) -> Result<u64> {
        if trees.is_empty() {
            return Ok(0);
        }
        let packages: Vec<Uuid> = trees.iter().map(|t| t.package_id.as_uuid()).collect();
        let paths: Vec<String> = trees.iter().map(|t| t.path.clone()).collect();
        let hashes: Vec<String> =
            trees.iter().map(|t| t.hash.as_str().to_string()).collect();
        let result = sqlx::query(
            r#"
            INSERT INTO file_trees (package_id, path, hash)
            SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::text[])
            ON CONFLICT (package_id, path) DO NOTHING
            "#,
        )
        .bind(packages)
        .bind(paths)
        .bind(hashes)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn file_trees_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<FileTree>> {
        let rows = sqlx::query(
            "SELECT path, hash FROM file_trees WHERE package_id = $1 ORDER BY path",
        )
        .bind(package_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let path: String = row.try_get("path")?;
                let hash: String = row.try_get("hash")?;
                Ok(FileTree::new(package_id, path, ContentHash::parse(hash)?))
            })
            .collect()
    }

    async fn delete_file_trees_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<ContentHash>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "DELETE FROM file_trees WHERE package_id = $1 RETURNING hash",
        )
        .bind(package_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|hash| ContentHash::parse(hash).map_err(ScanError::from))
            .collect()
    }

    async fn count_file_trees_for_hash(&self, hash: &ContentHash) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM file_trees WHERE hash = $1")
                .bind(hash.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_file(&self, hash: &ContentHash) -> Result<()> {
        // Findings cascade; license conclusions are not tied to the file row.
        sqlx::query("DELETE FROM files WHERE hash = $1")
            .bind(hash.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobRepository for PostgresScanStore {
    async fn insert_jobs(&self, jobs: &[ScannerJob]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for job in jobs {
            if let Some(parent) = job.parent_id {
                let grandparent: Option<Option<Uuid>> = sqlx::query_scalar(
                    "SELECT parent_id FROM scanner_jobs WHERE id = $1",
                )
                .bind(parent.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
                match grandparent {
                    None => {
                        return Err(ScanError::NotFound(format!("parent job {parent}")));
                    }
                    Some(Some(_)) => {
                        return Err(ScanError::DataIntegrity(format!(
                            "job {parent} is itself a child and cannot own children"
                        )));
                    }
                    Some(None) => {}
                }
            }
            sqlx::query(
                r#"
                INSERT INTO scanner_jobs (
                    id, package_id, parent_id, state, file_count,
                    timeout_secs, failure_message, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(job.package_id.as_uuid())
            .bind(job.parent_id.map(|p| p.as_uuid()))
            .bind(job.state.as_str())
            .bind(job.file_count.map(|c| c as i32))
            .bind(job.timeout_secs.map(|t| t as i32))
            .bind(job.failure_message.as_deref())
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<ScannerJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM scanner_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn children_of(&self, parent: JobId) -> Result<Vec<ScannerJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM scanner_jobs WHERE parent_id = $1 ORDER BY created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(parent.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn jobs_in_states(
        &self,
        states: &[JobState],
    ) -> Result<Vec<ScannerJob>> {
        let names: Vec<&str> = states.iter().map(JobState::as_str).collect();
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM scanner_jobs WHERE state = ANY($1) ORDER BY created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(names)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn jobs_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<ScannerJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM scanner_jobs WHERE package_id = $1 ORDER BY created_at"
        );
        let rows = sqlx::query(&sql)
            .bind(package_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn set_job_states(
        &self,
        ids: &[JobId],
        state: JobState,
        failure_message: Option<&str>,
    ) -> Result<Vec<JobId>> {
        let changed: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE scanner_jobs
            SET state = $2,
                failure_message = COALESCE($3, failure_message),
                updated_at = NOW()
            WHERE id = ANY($1) AND state = ANY($4)
            RETURNING id
            "#,
        )
        .bind(job_ids(ids))
        .bind(state.as_str())
        .bind(failure_message)
        .bind(state_names(&JobState::sources_of(state)))
        .fetch_all(&self.pool)
        .await?;
        Ok(changed.into_iter().map(JobId).collect())
    }

    async fn set_job_file_count(
        &self,
        id: JobId,
        file_count: u32,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE scanner_jobs SET file_count = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(file_count as i32)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ScanError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    async fn fail_jobs(
        &self,
        job_ids_in: &[JobId],
        message: &str,
    ) -> Result<Vec<JobId>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            UPDATE scanner_jobs
            SET state = 'failed', failure_message = $2, updated_at = NOW()
            WHERE id = ANY($1) AND state = ANY($3)
            RETURNING id, package_id
            "#,
        )
        .bind(job_ids(job_ids_in))
        .bind(message)
        .bind(state_names(&JobState::sources_of(JobState::Failed)))
        .fetch_all(&mut *tx)
        .await?;
        let (failed, packages) = changed_jobs(&rows)?;
        sqlx::query(
            "UPDATE packages SET scan_status = 'failed', updated_at = NOW() WHERE id = ANY($1)",
        )
        .bind(packages)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(failed)
    }

    async fn complete_jobs(&self, job_ids_in: &[JobId]) -> Result<Vec<JobId>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            UPDATE scanner_jobs
            SET state = 'completed', updated_at = NOW()
            WHERE id = ANY($1) AND state = ANY($2)
            RETURNING id, package_id
            "#,
        )
        .bind(job_ids(job_ids_in))
        .bind(state_names(&JobState::NON_FINAL))
        .fetch_all(&mut *tx)
        .await?;
        let (completed, packages) = changed_jobs(&rows)?;
        sqlx::query(
            "UPDATE packages SET scan_status = 'scanned', updated_at = NOW() WHERE id = ANY($1)",
        )
        .bind(packages)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(completed)
    }
}

#[async_trait]
impl FindingRepository for PostgresScanStore {
    async fn insert_license_finding(
        &self,
        finding: LicenseFinding,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO license_findings (
                hash, scanner, scanner_version, scanner_config,
                license_expression, matches, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(finding.hash.as_str())
        .bind(&finding.scanner.scanner)
        .bind(&finding.scanner.version)
        .bind(&finding.scanner.config)
        .bind(&finding.license_expression)
        .bind(serde_json::to_value(&finding.matches)?)
        .bind(finding.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_copyright_findings(
        &self,
        findings: Vec<CopyrightFinding>,
    ) -> Result<()> {
        if findings.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for finding in findings {
            sqlx::query(
                r#"
                INSERT INTO copyright_findings (
                    hash, scanner, scanner_version, scanner_config,
                    copyright, start_line, end_line, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(finding.hash.as_str())
            .bind(&finding.scanner.scanner)
            .bind(&finding.scanner.version)
            .bind(&finding.scanner.config)
            .bind(&finding.copyright)
            .bind(finding.start_line as i32)
            .bind(finding.end_line as i32)
            .bind(finding.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_scan_issues(&self, issues: Vec<ScanIssue>) -> Result<()> {
        if issues.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for issue in issues {
            sqlx::query(
                r#"
                INSERT INTO scan_issues (
                    hash, scanner, scanner_version, scanner_config, message, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(issue.hash.as_str())
            .bind(&issue.scanner.scanner)
            .bind(&issue.scanner.version)
            .bind(&issue.scanner.config)
            .bind(&issue.message)
            .bind(issue.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn license_findings_for(
        &self,
        hashes: &[ContentHash],
    ) -> Result<Vec<LicenseFinding>> {
        let rows = sqlx::query(
            "SELECT * FROM license_findings WHERE hash = ANY($1) ORDER BY id",
        )
        .bind(hash_strings(hashes))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let hash: String = row.try_get("hash")?;
                let matches: serde_json::Value = row.try_get("matches")?;
                Ok(LicenseFinding {
                    hash: ContentHash::parse(hash)?,
                    scanner: scanner_from_row(row)?,
                    license_expression: row.try_get("license_expression")?,
                    matches: serde_json::from_value::<Vec<LicenseMatch>>(matches)?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn copyright_findings_for(
        &self,
        hashes: &[ContentHash],
    ) -> Result<Vec<CopyrightFinding>> {
        let rows = sqlx::query(
            "SELECT * FROM copyright_findings WHERE hash = ANY($1) ORDER BY id",
        )
        .bind(hash_strings(hashes))
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let hash: String = row.try_get("hash")?;
                let start: i32 = row.try_get("start_line")?;
                let end: i32 = row.try_get("end_line")?;
                Ok(CopyrightFinding {
                    hash: ContentHash::parse(hash)?,
                    scanner: scanner_from_row(row)?,
                    copyright: row.try_get("copyright")?,
                    start_line: start.max(0) as u32,
                    end_line: end.max(0) as u32,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    async fn scan_issues_for(
        &self,
        hashes: &[ContentHash],
    ) -> Result<Vec<ScanIssue>> {
        let rows =
            sqlx::query("SELECT * FROM scan_issues WHERE hash = ANY($1) ORDER BY id")
                .bind(hash_strings(hashes))
                .fetch_all(&self.pool)
                .await?;
        rows.iter()
            .map(|row| {
                let hash: String = row.try_get("hash")?;
                Ok(ScanIssue {
                    hash: ContentHash::parse(hash)?,
                    scanner: scanner_from_row(row)?,
                    message: row.try_get("message")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ClearanceRepository for PostgresScanStore {
    async fn insert_group(&self, group: ClearanceGroup) -> Result<()> {
        sqlx::query(
            "INSERT INTO clearance_groups (id, name, created_at) VALUES ($1, $2, $3)",
        )
        .bind(group.id.as_uuid())
        .bind(&group.name)
        .bind(group.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_license_conclusions(
        &self,
        conclusions: Vec<LicenseConclusion>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut created = 0;
        for conclusion in conclusions {
            let result = sqlx::query(
                r#"
                INSERT INTO license_conclusions (
                    id, hash, package_id, detected_expression, concluded_expression,
                    comment, bulk_conclusion_id, curator, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(conclusion.id.as_uuid())
            .bind(conclusion.hash.as_str())
            .bind(conclusion.package_id.as_uuid())
            .bind(conclusion.detected_expression.as_deref())
            .bind(&conclusion.concluded_expression)
            .bind(conclusion.comment.as_deref())
            .bind(conclusion.bulk_conclusion_id.map(|b| b.as_uuid()))
            .bind(&conclusion.curator)
            .bind(conclusion.created_at)
            .execute(&mut *tx)
            .await?;
            link_groups(
                &mut tx,
                "license_conclusion_groups",
                conclusion.id.as_uuid(),
                &conclusion.group_ids,
            )
            .await?;
            created += result.rows_affected();
        }
        tx.commit().await?;
        Ok(created)
    }

    async fn license_conclusions_for_hashes(
        &self,
        hashes: &[ContentHash],
    ) -> Result<Vec<LicenseConclusion>> {
        let sql = format!("{CONCLUSION_SELECT} WHERE c.hash = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(hash_strings(hashes))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(conclusion_from_row).collect()
    }

    async fn license_conclusions_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<LicenseConclusion>> {
        let sql = format!("{CONCLUSION_SELECT} WHERE c.package_id = $1");
        let rows = sqlx::query(&sql)
            .bind(package_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(conclusion_from_row).collect()
    }

    async fn license_conclusions_for_bulk(
        &self,
        bulk_id: BulkConclusionId,
    ) -> Result<Vec<LicenseConclusion>> {
        let sql = format!("{CONCLUSION_SELECT} WHERE c.bulk_conclusion_id = $1");
        let rows = sqlx::query(&sql)
            .bind(bulk_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(conclusion_from_row).collect()
    }

    async fn insert_bulk_conclusion(&self, bulk: BulkConclusion) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO bulk_conclusions (
                id, package_id, pattern, detected_expression,
                concluded_expression, comment, curator, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(bulk.id.as_uuid())
        .bind(bulk.package_id.as_uuid())
        .bind(&bulk.pattern)
        .bind(bulk.detected_expression.as_deref())
        .bind(&bulk.concluded_expression)
        .bind(bulk.comment.as_deref())
        .bind(&bulk.curator)
        .bind(bulk.created_at)
        .execute(&mut *tx)
        .await?;
        link_groups(&mut tx, "bulk_conclusion_groups", bulk.id.as_uuid(), &bulk.group_ids)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_bulk_conclusion(
        &self,
        id: BulkConclusionId,
    ) -> Result<Option<BulkConclusion>> {
        let sql = format!("{BULK_SELECT} WHERE b.id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(bulk_from_row).transpose()
    }

    async fn bulk_conclusions_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<BulkConclusion>> {
        let sql = format!("{BULK_SELECT} WHERE b.package_id = $1");
        let rows = sqlx::query(&sql)
            .bind(package_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(bulk_from_row).collect()
    }

    async fn delete_bulk_conclusion(&self, id: BulkConclusionId) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query(
            "DELETE FROM license_conclusions WHERE bulk_conclusion_id = $1",
        )
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query("DELETE FROM bulk_conclusions WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn insert_path_exclusion(
        &self,
        exclusion: PathExclusion,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO path_exclusions (
                id, package_id, pattern, reason, comment, curator, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(exclusion.id.as_uuid())
        .bind(exclusion.package_id.as_uuid())
        .bind(&exclusion.pattern)
        .bind(&exclusion.reason)
        .bind(exclusion.comment.as_deref())
        .bind(&exclusion.curator)
        .bind(exclusion.created_at)
        .execute(&mut *tx)
        .await?;
        link_groups(
            &mut tx,
            "path_exclusion_groups",
            exclusion.id.as_uuid(),
            &exclusion.group_ids,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn path_exclusions_for_package(
        &self,
        package_id: PackageId,
    ) -> Result<Vec<PathExclusion>> {
        let rows = sqlx::query(
            r#"
            SELECT e.*,
                   ARRAY(SELECT g.group_id FROM path_exclusion_groups g
                         WHERE g.item_id = e.id) AS group_ids
            FROM path_exclusions e
            WHERE e.package_id = $1
            "#,
        )
        .bind(package_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(PathExclusion {
                    id: row.try_get::<Uuid, _>("id")?.into(),
                    package_id: PackageId(row.try_get("package_id")?),
                    pattern: row.try_get("pattern")?,
                    reason: row.try_get("reason")?,
                    comment: row.try_get("comment")?,
                    curator: row.try_get("curator")?,
                    group_ids: groups_from_row(row)?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl AlertRepository for PostgresScanStore {
    async fn record_alert(
        &self,
        key: &str,
        message: &str,
    ) -> Result<SystemAlert> {
        let row = sqlx::query(
            r#"
            INSERT INTO system_alerts (key, message, severity, occurrences, first_seen, last_seen)
            VALUES ($1, $2, 'low', 1, NOW(), NOW())
            ON CONFLICT (key) DO UPDATE SET
                message = EXCLUDED.message,
                occurrences = system_alerts.occurrences + 1,
                severity = CASE
                    WHEN system_alerts.occurrences + 1 >= 3 THEN 'high'
                    WHEN system_alerts.occurrences + 1 = 2 THEN 'medium'
                    ELSE 'low'
                END,
                last_seen = NOW()
            RETURNING *
            "#,
        )
        .bind(key)
        .bind(message)
        .fetch_one(&self.pool)
        .await?;
        alert_from_row(&row)
    }

    async fn alerts(&self) -> Result<Vec<SystemAlert>> {
        let rows = sqlx::query("SELECT * FROM system_alerts ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(alert_from_row).collect()
    }
}

fn alert_from_row(row: &PgRow) -> Result<SystemAlert> {
    let severity: String = row.try_get("severity")?;
    let occurrences: i32 = row.try_get("occurrences")?;
    let first_seen: DateTime<Utc> = row.try_get("first_seen")?;
    Ok(SystemAlert {
        key: row.try_get("key")?,
        message: row.try_get("message")?,
        severity: severity.parse::<AlertSeverity>()?,
        occurrences: occurrences.max(0) as u32,
        first_seen,
        last_seen: row.try_get("last_seen")?,
    })
}
