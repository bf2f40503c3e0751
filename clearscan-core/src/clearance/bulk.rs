//! Curator writes: groups, per-file conclusions, path exclusions and bulk
//! conclusions expanded over a package's file tree.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use clearscan_model::{
    BulkConclusion, BulkConclusionId, ClearanceGroup, ClearanceGroupId, ContentHash,
    LicenseConclusion, LicenseConclusionId, PackageId, PathExclusion, PathExclusionId,
};

use crate::database::ScanStore;
use crate::error::{Result, ScanError};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLicenseConclusion {
    pub hash: ContentHash,
    pub package_id: PackageId,
    #[serde(default)]
    pub detected_expression: Option<String>,
    pub concluded_expression: String,
    #[serde(default)]
    pub comment: Option<String>,
    pub curator: String,
    pub group_ids: Vec<ClearanceGroupId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBulkConclusion {
    pub package_id: PackageId,
    pub pattern: String,
    #[serde(default)]
    pub detected_expression: Option<String>,
    pub concluded_expression: String,
    #[serde(default)]
    pub comment: Option<String>,
    pub curator: String,
    pub group_ids: Vec<ClearanceGroupId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPathExclusion {
    pub package_id: PackageId,
    pub pattern: String,
    pub reason: String,
    #[serde(default)]
    pub comment: Option<String>,
    pub curator: String,
    pub group_ids: Vec<ClearanceGroupId>,
}

/// A bulk conclusion and the per-file conclusions generated for it.
#[derive(Clone, Debug)]
pub struct BulkOutcome {
    pub bulk: BulkConclusion,
    pub conclusions: Vec<LicenseConclusion>,
}

fn compile(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern)
        .map_err(|err| ScanError::InvalidRequest(format!("invalid glob `{pattern}`: {err}")))
}

fn require_groups(groups: &[ClearanceGroupId]) -> Result<()> {
    if groups.is_empty() {
        return Err(ScanError::InvalidRequest(
            "clearance items need at least one group".into(),
        ));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ClearanceCurator {
    store: Arc<dyn ScanStore>,
}

impl fmt::Debug for ClearanceCurator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClearanceCurator").finish_non_exhaustive()
    }
}

impl ClearanceCurator {
    pub fn new(store: Arc<dyn ScanStore>) -> Self {
        Self { store }
    }

    pub async fn create_group(&self, name: &str) -> Result<ClearanceGroup> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ScanError::InvalidRequest("group name is empty".into()));
        }
        let group = ClearanceGroup::new(name);
        self.store.insert_group(group.clone()).await?;
        Ok(group)
    }

    pub async fn add_license_conclusion(
        &self,
        request: NewLicenseConclusion,
    ) -> Result<LicenseConclusion> {
        require_groups(&request.group_ids)?;
        let conclusion = LicenseConclusion {
            id: LicenseConclusionId::new(),
            hash: request.hash,
            package_id: request.package_id,
            detected_expression: request.detected_expression,
            concluded_expression: request.concluded_expression,
            comment: request.comment,
            bulk_conclusion_id: None,
            curator: request.curator,
            group_ids: request.group_ids,
            created_at: Utc::now(),
        };
        self.store
            .insert_license_conclusions(vec![conclusion.clone()])
            .await?;
        Ok(conclusion)
    }

    pub async fn add_path_exclusion(&self, request: NewPathExclusion) -> Result<PathExclusion> {
        require_groups(&request.group_ids)?;
        compile(&request.pattern)?;
        let exclusion = PathExclusion {
            id: PathExclusionId::new(),
            package_id: request.package_id,
            pattern: request.pattern,
            reason: request.reason,
            comment: request.comment,
            curator: request.curator,
            group_ids: request.group_ids,
            created_at: Utc::now(),
        };
        self.store.insert_path_exclusion(exclusion.clone()).await?;
        Ok(exclusion)
    }

    /// Expands `pattern` over the package's file tree into one conclusion per
    /// distinct matched hash. Nothing stays persisted unless every expected
    /// conclusion was created.
    #[instrument(target = "scan::clearance", skip(self, request), fields(package_id = %request.package_id, pattern = %request.pattern))]
    pub async fn create_bulk_conclusion(&self, request: NewBulkConclusion) -> Result<BulkOutcome> {
        require_groups(&request.group_ids)?;
        let pattern = compile(&request.pattern)?;

        let trees = self.store.file_trees_for_package(request.package_id).await?;
        let mut matched: BTreeMap<ContentHash, String> = BTreeMap::new();
        for tree in trees {
            if pattern.matches_with(&tree.path, MATCH_OPTIONS) {
                matched.entry(tree.hash).or_insert(tree.path);
            }
        }
        if matched.is_empty() {
            return Err(ScanError::DataIntegrity(format!(
                "bulk conclusion pattern `{}` matches no files",
                request.pattern
            )));
        }

        let now = Utc::now();
        let bulk = BulkConclusion {
            id: BulkConclusionId::new(),
            package_id: request.package_id,
            pattern: request.pattern,
            detected_expression: request.detected_expression,
            concluded_expression: request.concluded_expression,
            comment: request.comment,
            curator: request.curator,
            group_ids: request.group_ids,
            created_at: now,
        };
        self.store.insert_bulk_conclusion(bulk.clone()).await?;

        let conclusions: Vec<LicenseConclusion> = matched
            .into_keys()
            .map(|hash| LicenseConclusion {
                id: LicenseConclusionId::new(),
                hash,
                package_id: bulk.package_id,
                detected_expression: bulk.detected_expression.clone(),
                concluded_expression: bulk.concluded_expression.clone(),
                comment: bulk.comment.clone(),
                bulk_conclusion_id: Some(bulk.id),
                curator: bulk.curator.clone(),
                group_ids: bulk.group_ids.clone(),
                created_at: now,
            })
            .collect();
        let expected = conclusions.len() as u64;

        let created = match self
            .store
            .insert_license_conclusions(conclusions.clone())
            .await
        {
            Ok(created) => created,
            Err(err) => {
                self.roll_back(bulk.id).await;
                return Err(err);
            }
        };
        if created != expected {
            self.roll_back(bulk.id).await;
            return Err(ScanError::DataIntegrity(format!(
                "bulk conclusion created {created} of {expected} file conclusions"
            )));
        }

        info!(target: "scan::clearance", bulk_id = %bulk.id, files = created, "bulk conclusion created");
        Ok(BulkOutcome { bulk, conclusions })
    }

    async fn roll_back(&self, id: BulkConclusionId) {
        if let Err(err) = self.store.delete_bulk_conclusion(id).await {
            warn!(target: "scan::clearance", bulk_id = %id, error = %err, "failed to roll back bulk conclusion");
        }
    }

    /// Removes the bulk conclusion and the conclusions it generated.
    pub async fn delete_bulk_conclusion(&self, id: BulkConclusionId) -> Result<u64> {
        if self.store.get_bulk_conclusion(id).await?.is_none() {
            return Err(ScanError::NotFound(format!("bulk conclusion {id}")));
        }
        let removed = self.store.delete_bulk_conclusion(id).await?;
        info!(target: "scan::clearance", bulk_id = %id, removed, "bulk conclusion deleted");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ClearanceRepository, FileRepository, InMemoryScanStore, PackageRepository};
    use clearscan_model::{FileRecord, FileTree, PackageSpec};

    fn hash(seed: char) -> ContentHash {
        ContentHash::parse(seed.to_string().repeat(64)).unwrap()
    }

    async fn seeded() -> (InMemoryScanStore, ClearanceCurator, PackageId, ClearanceGroupId) {
        let store = InMemoryScanStore::new();
        let package = store
            .upsert_package(&PackageSpec {
                purl: "pkg:npm/left-pad@1.3.0".parse().unwrap(),
                declared_license: None,
            })
            .await
            .unwrap();
        let files = [
            ("src/index.js", hash('a')),
            ("src/lib/pad.js", hash('b')),
            ("lib/copy.js", hash('a')),
            ("README.md", hash('c')),
        ];
        let mut trees = Vec::new();
        for (path, h) in &files {
            store
                .insert_file_if_absent(FileRecord::new(h.clone()))
                .await
                .unwrap();
            trees.push(FileTree::new(package.id, *path, h.clone()));
        }
        store.insert_file_trees(&trees).await.unwrap();

        let curator = ClearanceCurator::new(Arc::new(store.clone()));
        let group = curator.create_group("legal").await.unwrap();
        (store, curator, package.id, group.id)
    }

    fn bulk(package_id: PackageId, group: ClearanceGroupId, pattern: &str) -> NewBulkConclusion {
        NewBulkConclusion {
            package_id,
            pattern: pattern.into(),
            detected_expression: None,
            concluded_expression: "MIT".into(),
            comment: None,
            curator: "alice".into(),
            group_ids: vec![group],
        }
    }

    #[tokio::test]
    async fn bulk_expands_to_distinct_hashes() {
        let (store, curator, package_id, group) = seeded().await;
        let outcome = curator
            .create_bulk_conclusion(bulk(package_id, group, "**/*.js"))
            .await
            .unwrap();

        assert_eq!(outcome.conclusions.len(), 2);
        let stored = store.license_conclusions_for_bulk(outcome.bulk.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|c| c.bulk_conclusion_id == Some(outcome.bulk.id)));
    }

    #[tokio::test]
    async fn star_does_not_cross_directories() {
        let (_, curator, package_id, group) = seeded().await;
        let outcome = curator
            .create_bulk_conclusion(bulk(package_id, group, "src/*.js"))
            .await
            .unwrap();
        assert_eq!(outcome.conclusions.len(), 1);
        assert_eq!(outcome.conclusions[0].hash, hash('a'));
    }

    #[tokio::test]
    async fn pattern_without_matches_leaves_nothing_behind() {
        let (store, curator, package_id, group) = seeded().await;
        let err = curator
            .create_bulk_conclusion(bulk(package_id, group, "**/*.nomatch"))
            .await
            .unwrap_err();

        assert!(matches!(err, ScanError::DataIntegrity(_)));
        assert!(err.is_client_error());
        assert_eq!(store.license_conclusion_count().await, 0);
        assert!(store.bulk_conclusions_for_package(package_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_bulk_removes_generated_conclusions() {
        let (store, curator, package_id, group) = seeded().await;
        let outcome = curator
            .create_bulk_conclusion(bulk(package_id, group, "**"))
            .await
            .unwrap();
        assert_eq!(outcome.conclusions.len(), 3);

        let removed = curator.delete_bulk_conclusion(outcome.bulk.id).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.license_conclusion_count().await, 0);
        assert!(matches!(
            curator.delete_bulk_conclusion(outcome.bulk.id).await,
            Err(ScanError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_bad_glob_and_missing_groups() {
        let (_, curator, package_id, group) = seeded().await;
        assert!(matches!(
            curator.create_bulk_conclusion(bulk(package_id, group, "src/[")).await,
            Err(ScanError::InvalidRequest(_))
        ));
        let mut request = bulk(package_id, group, "**");
        request.group_ids.clear();
        assert!(matches!(
            curator.create_bulk_conclusion(request).await,
            Err(ScanError::InvalidRequest(_))
        ));
    }
}
