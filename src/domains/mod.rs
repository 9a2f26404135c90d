pub mod core;
pub mod inventory;

pub use inventory::{ImageInventoryService, InventoryEntry, InventoryRecord, ReconcileSummary};
