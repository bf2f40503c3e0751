//! Archive extraction and content hashing for ingest.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use futures::{StreamExt, TryStreamExt, stream};
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use clearscan_model::ContentHash;

use crate::error::{Result, ScanError};

/// Unpacks a gzip-compressed tarball into `dest`. Entries whose path would
/// leave `dest` abort the extraction; links and special files are skipped.
pub async fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<usize> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || extract_blocking(&archive, &dest))
        .await
        .map_err(|e| ScanError::Internal(format!("extraction task panicked: {e}")))?
}

fn extract_blocking(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive)
        .map_err(|e| ScanError::Archive(format!("cannot open {}: {e}", archive.display())))?;
    std::fs::create_dir_all(dest)?;
    let mut tarball = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let entries = tarball
        .entries()
        .map_err(|e| ScanError::Archive(format!("unreadable archive: {e}")))?;

    let mut extracted = 0;
    for entry in entries {
        let mut entry = entry.map_err(|e| ScanError::Archive(format!("corrupt entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| ScanError::Archive(format!("bad entry path: {e}")))?
            .into_owned();
        if !is_contained(&path) {
            return Err(ScanError::Archive(format!(
                "entry `{}` escapes the extraction root",
                path.display()
            )));
        }
        let kind = entry.header().entry_type();
        if !(kind.is_file() || kind.is_dir()) {
            debug!(target: "scan::ingest", path = %path.display(), "skipping non-regular archive entry");
            continue;
        }
        entry
            .unpack_in(dest)
            .map_err(|e| ScanError::Archive(format!("cannot unpack `{}`: {e}", path.display())))?;
        if kind.is_file() {
            extracted += 1;
        }
    }
    Ok(extracted)
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Hashes every regular file below `root`, grouping relative `/`-separated
/// paths by content hash.
pub async fn hash_tree(
    root: &Path,
    concurrency: usize,
) -> Result<BTreeMap<ContentHash, Vec<String>>> {
    let walk_root = root.to_path_buf();
    let files = tokio::task::spawn_blocking(move || list_files(&walk_root))
        .await
        .map_err(|e| ScanError::Internal(format!("walk task panicked: {e}")))??;

    let hashed: Vec<(ContentHash, String)> = stream::iter(files)
        .map(|(absolute, relative)| async move {
            let hash = tokio::task::spawn_blocking(move || sha256_file(&absolute))
                .await
                .map_err(|e| ScanError::Internal(format!("hash task panicked: {e}")))??;
            Ok::<_, ScanError>((hash, relative))
        })
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await?;

    let mut grouped: BTreeMap<ContentHash, Vec<String>> = BTreeMap::new();
    for (hash, path) in hashed {
        grouped.entry(hash).or_default().push(path);
    }
    for paths in grouped.values_mut() {
        paths.sort();
    }
    Ok(grouped)
}

fn list_files(root: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| ScanError::Io(io::Error::other(e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| ScanError::Internal(e.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push((entry.into_path(), relative));
    }
    Ok(files)
}

pub fn sha256_file(path: &Path) -> Result<ContentHash> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(ContentHash::parse(hex::encode(hasher.finalize()))?)
}
