use crate::config::InventoryConfig;
use crate::domains::inventory::repository::{ImageInventoryRepository, SqliteImageInventoryRepository};
use crate::domains::inventory::service::{ImageInventoryService, ImageInventoryServiceImpl};
use crate::errors::{ServiceError, ServiceResult};
use lazy_static::lazy_static;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// Global state definitions
lazy_static! {
    static ref INIT_MUTEX: tokio::sync::Mutex<()> = tokio::sync::Mutex::new(());
    static ref INITIALIZED: AtomicBool = AtomicBool::new(false);

    static ref DB_POOL: Mutex<Option<SqlitePool>> = Mutex::new(None);
    static ref INVENTORY_REPO: Mutex<Option<Arc<dyn ImageInventoryRepository>>> = Mutex::new(None);
    static ref INVENTORY_SERVICE: Mutex<Option<Arc<dyn ImageInventoryService>>> = Mutex::new(None);
}

/// Set up logging, the pool, the schema and the inventory service.
///
/// Safe to call more than once; only the first successful call does any work.
pub async fn initialize(config: &InventoryConfig) -> ServiceResult<()> {
    let _guard = INIT_MUTEX.lock().await;

    if INITIALIZED.load(Ordering::Acquire) {
        return Ok(());
    }

    let result = initialize_internal(config).await;

    // Mark as initialized only if successful
    if result.is_ok() {
        INITIALIZED.store(true, Ordering::Release);
    }

    result
}

async fn initialize_internal(config: &InventoryConfig) -> ServiceResult<()> {
    if std::env::var("RUST_LOG").is_err() {
        #[cfg(debug_assertions)]
        std::env::set_var("RUST_LOG", "debug");
        #[cfg(not(debug_assertions))]
        std::env::set_var("RUST_LOG", "info");
    }
    let _ = env_logger::try_init();

    log::info!("Starting inventory initialization");
    log::debug!("Database URL: {}", config.database_url);
    log::debug!(
        "Reconcile policies: reactivation={}, missing_key={}",
        config.reactivation_policy.as_str(),
        config.missing_key_policy.as_str()
    );

    let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
    if config.is_in_memory() {
        // The database vanishes with its last connection.
        pool_options = pool_options.max_connections(1).idle_timeout(None).max_lifetime(None);
    }
    let pool = pool_options.connect(&config.database_url).await.map_err(|e| {
        log::error!("Database connection failed: {}", e);
        ServiceError::Configuration(format!("Database connection failed: {}", e))
    })?;
    log::info!("Database connection established");

    crate::db_migration::initialize_database(&pool).await.map_err(|e| {
        log::error!("Database initialization failed: {}", e);
        e
    })?;

    let repo: Arc<dyn ImageInventoryRepository> =
        Arc::new(SqliteImageInventoryRepository::new(pool.clone()));
    let service: Arc<dyn ImageInventoryService> = Arc::new(ImageInventoryServiceImpl::new(
        pool.clone(),
        repo.clone(),
        config.reconcile_options(),
    ));

    *DB_POOL.lock().map_err(|_| poisoned("DB_POOL"))? = Some(pool);
    *INVENTORY_REPO.lock().map_err(|_| poisoned("INVENTORY_REPO"))? = Some(repo);
    *INVENTORY_SERVICE.lock().map_err(|_| poisoned("INVENTORY_SERVICE"))? = Some(service);

    log::info!("Inventory initialization completed");
    Ok(())
}

fn poisoned(name: &str) -> ServiceError {
    ServiceError::ServiceUnavailable(format!("{} lock poisoned", name))
}

fn not_initialized(name: &str) -> ServiceError {
    ServiceError::Configuration(format!("{} not initialized", name))
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

pub fn get_db_pool() -> ServiceResult<SqlitePool> {
    DB_POOL.lock().map_err(|_| poisoned("DB_POOL"))?.clone().ok_or_else(|| not_initialized("Database pool"))
}

pub fn get_inventory_repo() -> ServiceResult<Arc<dyn ImageInventoryRepository>> {
    INVENTORY_REPO.lock().map_err(|_| poisoned("INVENTORY_REPO"))?.clone().ok_or_else(|| not_initialized("ImageInventoryRepository"))
}

pub fn get_inventory_service() -> ServiceResult<Arc<dyn ImageInventoryService>> {
    INVENTORY_SERVICE.lock().map_err(|_| poisoned("INVENTORY_SERVICE"))?.clone().ok_or_else(|| not_initialized("ImageInventoryService"))
}
