use std::fmt;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use clearscan_model::ContentHash;

use super::{ObjectStorage, hash_key};
use crate::error::{Result, ScanError};

/// Directory-backed object store. Presigned URLs are plain `file://` URLs.
#[derive(Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
}

impl fmt::Debug for LocalObjectStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalObjectStorage")
            .field("root", &self.root)
            .finish()
    }
}

impl LocalObjectStorage {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let root = tokio::fs::canonicalize(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stores raw bytes under `key`, replacing any previous object.
    pub async fn put_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !clean {
            return Err(ScanError::Storage(format!("invalid object key `{key}`")));
        }
        Ok(self.root.join(relative))
    }

    fn url_for(&self, key: &str) -> Result<Url> {
        let path = self.object_path(key)?;
        Url::from_file_path(&path).map_err(|_| {
            ScanError::Storage(format!("cannot build URL for {}", path.display()))
        })
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn download(&self, key: &str, dest_dir: &Path) -> Result<PathBuf> {
        let source = self.object_path(key)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(ScanError::NotFound(format!("object `{key}`")));
        }
        let file_name = source
            .file_name()
            .map(|name| name.to_os_string())
            .ok_or_else(|| ScanError::Storage(format!("object `{key}` has no file name")))?;
        tokio::fs::create_dir_all(dest_dir).await?;
        let target = dest_dir.join(file_name);
        tokio::fs::copy(&source, &target).await?;
        debug!(key, target = %target.display(), "downloaded object");
        Ok(target)
    }

    async fn upload_by_hash(&self, hash: &ContentHash, local_path: &Path) -> Result<()> {
        let target = self.object_path(&hash_key(hash))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Publish through a hard link so an existing object is never overwritten.
        let tmp = target.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::copy(local_path, &tmp).await?;
        let linked = tokio::fs::hard_link(&tmp, &target).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(%hash, "object already stored");
                Ok(())
            }
            Err(e) => Err(ScanError::Io(e)),
        }
    }

    async fn presigned_put(&self, key: &str) -> Result<Url> {
        self.url_for(key)
    }

    async fn presigned_get(&self, hash: &ContentHash) -> Result<Url> {
        self.url_for(&hash_key(hash))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(key)?).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.object_path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ScanError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(byte: char) -> ContentHash {
        ContentHash::parse(byte.to_string().repeat(64)).unwrap()
    }

    #[tokio::test]
    async fn rejects_keys_escaping_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(dir.path()).await.unwrap();
        assert!(storage.exists("../outside").await.is_err());
        assert!(storage.exists("/etc/passwd").await.is_err());
        assert!(!storage.exists("archives/missing.tgz").await.unwrap());
    }

    #[tokio::test]
    async fn upload_by_hash_is_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(dir.path().join("store")).await.unwrap();
        let first = dir.path().join("first.txt");
        let second = dir.path().join("second.txt");
        tokio::fs::write(&first, b"original").await.unwrap();
        tokio::fs::write(&second, b"replacement").await.unwrap();

        let hash = hash_of('a');
        storage.upload_by_hash(&hash, &first).await.unwrap();
        storage.upload_by_hash(&hash, &second).await.unwrap();

        let stored = tokio::fs::read(storage.root().join(hash_key(&hash))).await.unwrap();
        assert_eq!(stored, b"original");
        assert!(storage.presigned_get(&hash).await.unwrap().scheme() == "file");

        storage.delete(&hash_key(&hash)).await.unwrap();
        assert!(!storage.exists(&hash_key(&hash)).await.unwrap());
        storage.delete(&hash_key(&hash)).await.unwrap();
    }

    #[tokio::test]
    async fn download_copies_into_destination() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalObjectStorage::new(dir.path().join("store")).await.unwrap();
        storage.put_bytes("archives/pkg.tgz", b"bytes").await.unwrap();

        let dest = dir.path().join("work");
        let path = storage.download("archives/pkg.tgz", &dest).await.unwrap();
        assert_eq!(path, dest.join("pkg.tgz"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"bytes");

        let err = storage.download("archives/none.tgz", &dest).await.unwrap_err();
        assert!(matches!(err, ScanError::NotFound(_)));
    }
}
