//! Content ledger: decides which hashes still need a scan and records every
//! path occurrence as a file tree row.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, stream};
use tracing::debug;

use clearscan_model::{ContentHash, FileRecord, FileTree, PackageId, WorkerFile};

use crate::database::ScanStore;
use crate::error::Result;
use crate::orchestration::config::DedupConfig;

#[derive(Clone)]
pub struct ContentLedger {
    store: Arc<dyn ScanStore>,
    config: DedupConfig,
}

impl fmt::Debug for ContentLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentLedger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ContentLedger {
    pub fn new(store: Arc<dyn ScanStore>, config: DedupConfig) -> Self {
        Self { store, config }
    }

    /// Creates missing file and file tree rows for `package_id` and returns
    /// one `(hash, first path)` per hash that is not yet scanned, ordered by
    /// path. Already scanned content is never returned.
    pub async fn resolve(
        &self,
        package_id: PackageId,
        hash_to_paths: BTreeMap<ContentHash, Vec<String>>,
    ) -> Result<Vec<WorkerFile>> {
        let concurrency = self.config.concurrency.max(1);
        let pending = hash_to_paths.into_iter().filter(|(_, paths)| !paths.is_empty());

        let mut needs_scan: Vec<WorkerFile> = stream::iter(pending)
            .map(|(hash, paths)| {
                let store = self.store.clone();
                async move {
                    let (record, created) =
                        store.insert_file_if_absent(FileRecord::new(hash.clone())).await?;
                    let trees: Vec<FileTree> = paths
                        .iter()
                        .map(|path| FileTree::new(package_id, path.clone(), hash.clone()))
                        .collect();
                    store.insert_file_trees(&trees).await?;

                    let emit = created || record.scan_status.needs_scan();
                    Ok::<_, crate::error::ScanError>(emit.then(|| WorkerFile {
                        hash,
                        path: paths[0].clone(),
                    }))
                }
            })
            .buffer_unordered(concurrency)
            .try_filter_map(|file| futures::future::ready(Ok(file)))
            .try_collect()
            .await?;

        needs_scan.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(target: "scan::ingest", %package_id, needs_scan = needs_scan.len(), "resolved content ledger");
        Ok(needs_scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{FileRepository, InMemoryScanStore, PackageRepository};
    use clearscan_model::{FileScanStatus, PackageSpec};

    fn hash(byte: char) -> ContentHash {
        ContentHash::parse(byte.to_string().repeat(64)).unwrap()
    }

    async fn package(store: &InMemoryScanStore, raw: &str) -> PackageId {
        store
            .upsert_package(&PackageSpec {
                purl: raw.parse().unwrap(),
                declared_license: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn duplicate_content_is_emitted_once_with_every_path_recorded() {
        let store = InMemoryScanStore::new();
        let pkg = package(&store, "pkg:npm/dup@1.0.0").await;
        let ledger = ContentLedger::new(Arc::new(store.clone()), DedupConfig::default());

        let mut input = BTreeMap::new();
        input.insert(hash('a'), vec!["src/a.js".to_string(), "dist/a.js".to_string()]);
        input.insert(hash('b'), vec!["README.md".to_string()]);

        let needs = ledger.resolve(pkg, input).await.unwrap();
        assert_eq!(needs.len(), 2);
        assert_eq!(needs[0].path, "README.md");
        assert_eq!(needs[1].path, "src/a.js");
        assert_eq!(store.file_count().await, 2);
        assert_eq!(store.file_trees_for_package(pkg).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn scanned_content_is_never_emitted_again() {
        let store = InMemoryScanStore::new();
        let first = package(&store, "pkg:npm/first@1.0.0").await;
        let second = package(&store, "pkg:npm/second@1.0.0").await;
        let ledger = ContentLedger::new(Arc::new(store.clone()), DedupConfig::default());

        let input = BTreeMap::from([(hash('c'), vec!["lib/index.js".to_string()])]);
        assert_eq!(ledger.resolve(first, input).await.unwrap().len(), 1);
        store
            .set_file_status(&[hash('c')], FileScanStatus::Scanned)
            .await
            .unwrap();

        let input = BTreeMap::from([(
            hash('c'),
            vec!["index.js".to_string(), "copy/index.js".to_string()],
        )]);
        assert!(ledger.resolve(second, input.clone()).await.unwrap().is_empty());
        // Resolving again is idempotent.
        assert!(ledger.resolve(second, input).await.unwrap().is_empty());

        assert_eq!(store.file_count().await, 1);
        assert_eq!(store.count_file_trees_for_hash(&hash('c')).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn failed_content_is_offered_for_rescan() {
        let store = InMemoryScanStore::new();
        let pkg = package(&store, "pkg:npm/retry@1.0.0").await;
        let ledger = ContentLedger::new(Arc::new(store.clone()), DedupConfig::default());
        let input = BTreeMap::from([(hash('d'), vec!["a.c".to_string()])]);

        ledger.resolve(pkg, input.clone()).await.unwrap();
        store
            .set_file_status(&[hash('d')], FileScanStatus::Failed)
            .await
            .unwrap();
        assert_eq!(ledger.resolve(pkg, input).await.unwrap().len(), 1);
    }
}
