use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

/// Single-connection in-memory database with the schema applied.
///
/// Every SQLite memory connection is its own database, so the pool must never
/// open a second one or recycle the first.
pub(crate) async fn migrated_memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    crate::db_migration::initialize_database(&pool).await.unwrap();
    pool
}
