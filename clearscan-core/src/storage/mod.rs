//! Object storage contract for archives and content-addressed file uploads.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use clearscan_model::ContentHash;
use url::Url;

use crate::error::Result;

pub mod local;

pub use local::LocalObjectStorage;

/// Key under which the bytes of `hash` are stored.
pub fn hash_key(hash: &ContentHash) -> String {
    format!("files/{hash}")
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Copies the object into `dest_dir` and returns the local path.
    async fn download(&self, key: &str, dest_dir: &Path) -> Result<PathBuf>;

    /// Stores `local_path` under [`hash_key`]. Existing objects are left
    /// untouched since the key already names the content.
    async fn upload_by_hash(&self, hash: &ContentHash, local_path: &Path) -> Result<()>;

    async fn presigned_put(&self, key: &str) -> Result<Url>;

    async fn presigned_get(&self, hash: &ContentHash) -> Result<Url>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;
}
