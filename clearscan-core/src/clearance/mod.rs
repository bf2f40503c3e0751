pub mod bulk;
pub mod resolver;

pub use bulk::{
    BulkOutcome, ClearanceCurator, NewBulkConclusion, NewLicenseConclusion, NewPathExclusion,
};
pub use resolver::{ClearanceResolver, EffectiveClearance, GroupRanking, RankedItem};
