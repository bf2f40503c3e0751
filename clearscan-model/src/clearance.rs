//! Curator clearance items and the groups that hold them.
//!
//! Membership in a group carries no rank; callers supply the ranking per
//! resolution request. `group_ids` is the loaded view of the membership join.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::files::ContentHash;
use crate::ids::{
    BulkConclusionId, ClearanceGroupId, LicenseConclusionId, PackageId,
    PathExclusionId,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearanceGroup {
    pub id: ClearanceGroupId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl ClearanceGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ClearanceGroupId::new(),
            name: name.into(),
            created_at: Utc::now(),
        }
    }
}

/// Per-file license decision, either entered directly or generated by a bulk
/// conclusion (`bulk_conclusion_id` is then set).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseConclusion {
    pub id: LicenseConclusionId,
    pub hash: ContentHash,
    pub package_id: PackageId,
    pub detected_expression: Option<String>,
    pub concluded_expression: String,
    pub comment: Option<String>,
    pub bulk_conclusion_id: Option<BulkConclusionId>,
    pub curator: String,
    pub group_ids: Vec<ClearanceGroupId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkConclusion {
    pub id: BulkConclusionId,
    pub package_id: PackageId,
    pub pattern: String,
    pub detected_expression: Option<String>,
    pub concluded_expression: String,
    pub comment: Option<String>,
    pub curator: String,
    pub group_ids: Vec<ClearanceGroupId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathExclusion {
    pub id: PathExclusionId,
    pub package_id: PackageId,
    pub pattern: String,
    pub reason: String,
    pub comment: Option<String>,
    pub curator: String,
    pub group_ids: Vec<ClearanceGroupId>,
    pub created_at: DateTime<Utc>,
}
