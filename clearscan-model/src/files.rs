use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ModelError, Result};
use crate::ids::PackageId;

/// Lower-case hex sha256 of a file's bytes; the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn parse(raw: impl AsRef<str>) -> Result<Self> {
        let raw = raw.as_ref().trim();
        if raw.len() != 64 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ModelError::InvalidHash(raw.to_string()));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileScanStatus {
    NotStarted,
    Scanned,
    Failed,
}

impl FileScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileScanStatus::NotStarted => "notStarted",
            FileScanStatus::Scanned => "scanned",
            FileScanStatus::Failed => "failed",
        }
    }

    /// Content in this state still has to be sent to the worker.
    pub fn needs_scan(&self) -> bool {
        !matches!(self, FileScanStatus::Scanned)
    }
}

impl FromStr for FileScanStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "notStarted" => Ok(FileScanStatus::NotStarted),
            "scanned" => Ok(FileScanStatus::Scanned),
            "failed" => Ok(FileScanStatus::Failed),
            other => Err(ModelError::UnknownState(other.to_string())),
        }
    }
}

/// Content-addressed file row. Shared by every FileTree that points at it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub hash: ContentHash,
    pub scan_status: FileScanStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(hash: ContentHash) -> Self {
        let now = Utc::now();
        Self {
            hash,
            scan_status: FileScanStatus::NotStarted,
            created_at: now,
            updated_at: now,
        }
    }
}

/// `(package, path) -> file`. Unique per `(package_id, path)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileTree {
    pub package_id: PackageId,
    pub path: String,
    pub hash: ContentHash,
}

impl FileTree {
    pub fn new(
        package_id: PackageId,
        path: impl Into<String>,
        hash: ContentHash,
    ) -> Self {
        Self {
            package_id,
            path: path.into(),
            hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_lowercased_and_validated() {
        let upper = "A".repeat(64);
        let hash = ContentHash::parse(&upper).unwrap();
        assert_eq!(hash.as_str(), "a".repeat(64));
        assert!(ContentHash::parse("abc").is_err());
        assert!(ContentHash::parse("z".repeat(64)).is_err());
    }
}
