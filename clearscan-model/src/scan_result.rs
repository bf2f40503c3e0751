//! Scan payload produced by the external worker once a job completes.

use serde::{Deserialize, Serialize};

use crate::files::ContentHash;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResultPayload {
    pub tool: ToolMetadata,
    #[serde(default)]
    pub files: Vec<FileScanResult>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub options: String,
}

/// One file's results, in worker order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileScanResult {
    pub path: String,
    pub sha256: ContentHash,
    #[serde(default)]
    pub detected_license_expression: Option<String>,
    #[serde(default)]
    pub license_detections: Vec<LicenseDetection>,
    #[serde(default)]
    pub copyrights: Vec<DetectedCopyright>,
    #[serde(default)]
    pub scan_errors: Vec<String>,
}

impl FileScanResult {
    pub fn match_count(&self) -> usize {
        self.license_detections
            .iter()
            .map(|detection| detection.matches.len())
            .sum()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseDetection {
    pub license_expression: String,
    #[serde(default)]
    pub matches: Vec<DetectedMatch>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedMatch {
    pub license_expression: String,
    pub score: f64,
    pub start_line: u32,
    pub end_line: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedCopyright {
    pub copyright: String,
    pub start_line: u32,
    pub end_line: u32,
}
