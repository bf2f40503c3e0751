//! Immutable scan findings, keyed by file + scanner + scanner config.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::files::ContentHash;

/// Identifies which tool run produced a finding.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScannerConfigKey {
    pub scanner: String,
    pub version: String,
    pub config: String,
}

impl fmt::Display for ScannerConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} [{}]", self.scanner, self.version, self.config)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LicenseMatch {
    pub license_expression: String,
    pub score: f64,
    pub start_line: u32,
    pub end_line: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LicenseFinding {
    pub hash: ContentHash,
    pub scanner: ScannerConfigKey,
    pub license_expression: String,
    pub matches: Vec<LicenseMatch>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyrightFinding {
    pub hash: ContentHash,
    pub scanner: ScannerConfigKey,
    pub copyright: String,
    pub start_line: u32,
    pub end_line: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanIssue {
    pub hash: ContentHash,
    pub scanner: ScannerConfigKey,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
