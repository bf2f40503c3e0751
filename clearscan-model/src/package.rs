use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{ModelError, Result};
use crate::ids::PackageId;
use crate::purl::Purl;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PackageScanStatus {
    NotScanned,
    Pending,
    Scanned,
    Failed,
}

impl PackageScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageScanStatus::NotScanned => "notScanned",
            PackageScanStatus::Pending => "pending",
            PackageScanStatus::Scanned => "scanned",
            PackageScanStatus::Failed => "failed",
        }
    }
}

impl FromStr for PackageScanStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "notScanned" => Ok(PackageScanStatus::NotScanned),
            "pending" => Ok(PackageScanStatus::Pending),
            "scanned" => Ok(PackageScanStatus::Scanned),
            "failed" => Ok(PackageScanStatus::Failed),
            other => Err(ModelError::UnknownState(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub id: PackageId,
    pub purl: Purl,
    pub scan_status: PackageScanStatus,
    pub declared_license: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Package {
    pub fn new(purl: Purl, declared_license: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: PackageId::new(),
            purl,
            scan_status: PackageScanStatus::NotScanned,
            declared_license,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Canonical shape every job submission is normalised into before it
/// reaches the core.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageSpec {
    pub purl: Purl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declared_license: Option<String>,
}
