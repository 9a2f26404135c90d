// Public modules
pub mod config;
pub mod domains;
pub mod errors;
pub mod globals;
pub mod validation;

// Private modules
mod db_migration;

pub use config::InventoryConfig;
pub use domains::inventory::{
    ImageInventoryService, InventoryEntry, InventoryRecord, InventoryState, MatchingKey,
    MissingKeyPolicy, ReactivationPolicy, ReconcileSummary,
};
pub use errors::{DbError, DomainError, ServiceError, ServiceResult, ValidationError};

/// Initialize logging, the database and the inventory service.
/// This function must be called before any other function in the library.
pub async fn initialize(config: &InventoryConfig) -> ServiceResult<()> {
    globals::initialize(config).await
}

/// Get a reference to the SQLite connection pool
pub fn get_db_pool() -> ServiceResult<sqlx::SqlitePool> {
    globals::get_db_pool()
}

/// Reconcile one snapshot through the globally initialized service.
pub async fn reconcile(
    account: &str,
    inventory_type: &str,
    snapshot: Vec<InventoryEntry>,
) -> ServiceResult<ReconcileSummary> {
    globals::get_inventory_service()?
        .reconcile(account, inventory_type, snapshot)
        .await
}
