//! Ranked merge of clearance items from several groups into one effective
//! answer per pattern or per file.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use clearscan_model::{
    BulkConclusion, ClearanceGroupId, ContentHash, LicenseConclusion, PackageId, PathExclusion,
};

use crate::database::ScanStore;
use crate::error::Result;

/// What a caller sees for one package under its group ranking.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveClearance {
    /// One per pattern.
    pub path_exclusions: Vec<PathExclusion>,
    /// One per file hash.
    pub license_conclusions: Vec<LicenseConclusion>,
    /// One per pattern.
    pub bulk_conclusions: Vec<BulkConclusion>,
}

/// Anything that belongs to clearance groups and competes for one slot.
pub trait RankedItem {
    fn group_ids(&self) -> &[ClearanceGroupId];
    fn created_at(&self) -> DateTime<Utc>;
    fn item_uuid(&self) -> Uuid;
}

impl RankedItem for PathExclusion {
    fn group_ids(&self) -> &[ClearanceGroupId] {
        &self.group_ids
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn item_uuid(&self) -> Uuid {
        self.id.as_uuid()
    }
}

impl RankedItem for LicenseConclusion {
    fn group_ids(&self) -> &[ClearanceGroupId] {
        &self.group_ids
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn item_uuid(&self) -> Uuid {
        self.id.as_uuid()
    }
}

impl RankedItem for BulkConclusion {
    fn group_ids(&self) -> &[ClearanceGroupId] {
        &self.group_ids
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn item_uuid(&self) -> Uuid {
        self.id.as_uuid()
    }
}

/// Rank = position in the caller's list, 0 being the highest priority.
/// Groups missing from the list are invisible.
#[derive(Clone, Debug)]
pub struct GroupRanking {
    ranks: HashMap<ClearanceGroupId, usize>,
}

impl GroupRanking {
    pub fn new(ranked: &[ClearanceGroupId]) -> Self {
        let mut ranks = HashMap::with_capacity(ranked.len());
        for (position, id) in ranked.iter().enumerate() {
            ranks.entry(*id).or_insert(position);
        }
        Self { ranks }
    }

    /// Best rank among the item's groups, if any of them is visible.
    pub fn rank_of(&self, item: &impl RankedItem) -> Option<usize> {
        item.group_ids()
            .iter()
            .filter_map(|id| self.ranks.get(id).copied())
            .min()
    }

    /// Keeps exactly one visible item per key: the best-ranked one, then the
    /// most recently created, then the highest id so the answer is stable.
    pub fn pick<T, K, F>(&self, items: Vec<T>, key: F) -> Vec<T>
    where
        T: RankedItem,
        K: Ord,
        F: Fn(&T) -> K,
    {
        let mut winners: BTreeMap<K, (usize, T)> = BTreeMap::new();
        for item in items {
            let Some(rank) = self.rank_of(&item) else {
                continue;
            };
            let slot = key(&item);
            let replace = match winners.get(&slot) {
                None => true,
                Some((best_rank, best)) => {
                    (rank, std::cmp::Reverse(item.created_at()), std::cmp::Reverse(item.item_uuid()))
                        < (
                            *best_rank,
                            std::cmp::Reverse(best.created_at()),
                            std::cmp::Reverse(best.item_uuid()),
                        )
                }
            };
            if replace {
                winners.insert(slot, (rank, item));
            }
        }
        winners.into_values().map(|(_, item)| item).collect()
    }
}

#[derive(Clone)]
pub struct ClearanceResolver {
    store: Arc<dyn ScanStore>,
}

impl fmt::Debug for ClearanceResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClearanceResolver").finish_non_exhaustive()
    }
}

impl ClearanceResolver {
    pub fn new(store: Arc<dyn ScanStore>) -> Self {
        Self { store }
    }

    /// License conclusions are matched by content hash, so a conclusion made
    /// for the same file under another package applies here as well.
    pub async fn resolve(
        &self,
        package_id: PackageId,
        ranked_groups: &[ClearanceGroupId],
    ) -> Result<EffectiveClearance> {
        let ranking = GroupRanking::new(ranked_groups);

        let exclusions = self.store.path_exclusions_for_package(package_id).await?;
        let bulks = self.store.bulk_conclusions_for_package(package_id).await?;
        let mut hashes: Vec<ContentHash> = self
            .store
            .file_trees_for_package(package_id)
            .await?
            .into_iter()
            .map(|tree| tree.hash)
            .collect();
        hashes.sort();
        hashes.dedup();
        let conclusions = self.store.license_conclusions_for_hashes(&hashes).await?;

        let effective = EffectiveClearance {
            path_exclusions: ranking.pick(exclusions, |e| e.pattern.clone()),
            license_conclusions: ranking.pick(conclusions, |c| c.hash.clone()),
            bulk_conclusions: ranking.pick(bulks, |b| b.pattern.clone()),
        };
        debug!(
            target: "scan::clearance",
            %package_id,
            groups = ranked_groups.len(),
            exclusions = effective.path_exclusions.len(),
            conclusions = effective.license_conclusions.len(),
            bulks = effective.bulk_conclusions.len(),
            "resolved clearance"
        );
        Ok(effective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clearscan_model::{LicenseConclusionId, PathExclusionId};

    fn conclusion(
        hash: &ContentHash,
        group: ClearanceGroupId,
        expression: &str,
        created: DateTime<Utc>,
    ) -> LicenseConclusion {
        LicenseConclusion {
            id: LicenseConclusionId::new(),
            hash: hash.clone(),
            package_id: PackageId::new(),
            detected_expression: None,
            concluded_expression: expression.to_string(),
            comment: None,
            bulk_conclusion_id: None,
            curator: "curator".into(),
            group_ids: vec![group],
            created_at: created,
        }
    }

    fn day(month: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, month, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn caller_order_decides_rank() {
        let hash = ContentHash::parse("1".repeat(64)).unwrap();
        let (g1, g2, g3) = (ClearanceGroupId::new(), ClearanceGroupId::new(), ClearanceGroupId::new());
        let items = vec![
            conclusion(&hash, g3, "Apache-2.0", day(1)),
            conclusion(&hash, g1, "MIT", day(3)),
            conclusion(&hash, g2, "GPL-3.0", day(2)),
        ];

        let picked = GroupRanking::new(&[g3, g1, g2]).pick(items, |c| c.hash.clone());
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].concluded_expression, "Apache-2.0");
    }

    #[test]
    fn newest_wins_within_a_group() {
        let hash = ContentHash::parse("2".repeat(64)).unwrap();
        let group = ClearanceGroupId::new();
        let items = vec![
            conclusion(&hash, group, "BSD-3-Clause", day(2)),
            conclusion(&hash, group, "MIT", day(1)),
        ];
        let picked = GroupRanking::new(&[group]).pick(items, |c| c.hash.clone());
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].created_at, day(2));
        assert_eq!(picked[0].concluded_expression, "BSD-3-Clause");
    }

    #[test]
    fn unlisted_groups_are_invisible() {
        let listed = ClearanceGroupId::new();
        let hidden = ClearanceGroupId::new();
        let exclusion = |group, pattern: &str| PathExclusion {
            id: PathExclusionId::new(),
            package_id: PackageId::new(),
            pattern: pattern.to_string(),
            reason: "test fixtures".into(),
            comment: None,
            curator: "curator".into(),
            group_ids: vec![group],
            created_at: day(1),
        };
        let picked = GroupRanking::new(&[listed]).pick(
            vec![exclusion(hidden, "test/**"), exclusion(listed, "docs/**")],
            |e| e.pattern.clone(),
        );
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].pattern, "docs/**");
        assert!(GroupRanking::new(&[]).rank_of(&picked[0]).is_none());
    }

    #[test]
    fn item_in_several_groups_takes_its_best_rank() {
        let hash = ContentHash::parse("3".repeat(64)).unwrap();
        let (high, low) = (ClearanceGroupId::new(), ClearanceGroupId::new());
        let mut shared = conclusion(&hash, low, "ISC", day(1));
        shared.group_ids.push(high);
        let newer = conclusion(&hash, low, "MIT", day(5));

        let picked = GroupRanking::new(&[high, low]).pick(vec![newer, shared], |c| c.hash.clone());
        assert_eq!(picked[0].concluded_expression, "ISC");
    }
}
