pub mod identity;
pub mod locks;
pub mod reconciler;
pub mod repository;
pub mod service;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use identity::{build_key, build_record_key, MatchingKey};
pub use locks::PairLocks;
pub use reconciler::{plan_reconciliation, ReconcileContext, ReconcileOptions, ReconciliationPlan, TimestampRefresh};
pub use repository::{ImageInventoryRepository, SqliteImageInventoryRepository};
pub use service::{ImageInventoryService, ImageInventoryServiceImpl};
pub use types::{
    InventoryEntry, InventoryRecord, InventoryRow, InventoryState, MissingKeyPolicy,
    NewInventoryRecord, ReactivationPolicy, ReconcileSummary,
};
