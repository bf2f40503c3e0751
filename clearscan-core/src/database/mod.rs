//! Persistence contract and its implementations.

pub mod memory;
pub mod ports;

#[cfg(feature = "database")]
#[cfg_attr(docsrs, doc(cfg(feature = "database")))]
pub mod postgres;

pub use memory::InMemoryScanStore;
pub use ports::{
    AlertRepository, ClearanceRepository, FileRepository, FindingRepository,
    JobRepository, PackageRepository, ScanStore,
};

#[cfg(feature = "database")]
pub use postgres::PostgresScanStore;
