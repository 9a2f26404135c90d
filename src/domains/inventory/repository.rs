use crate::domains::core::repository::FindById;
use crate::domains::inventory::types::{
    to_db_timestamp, InventoryRecord, InventoryRow, InventoryState, NewInventoryRecord,
};
use crate::errors::{DbError, DomainError, DomainResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, query_scalar, Pool, Sqlite, Transaction};
use uuid::Uuid;

const SELECT_COLUMNS: &str = "SELECT id, account, inventory_type, image_tag, image_repo_digest, attributes, state, created_at, last_updated FROM image_inventory";

/// Store operations the reconciler relies on.
///
/// The `_with_tx` methods run inside a caller-owned transaction; the others
/// open and commit their own.
#[async_trait]
pub trait ImageInventoryRepository: FindById<InventoryRecord> + Send + Sync {
    /// Records of one partition, optionally filtered by state, ordered by
    /// creation time then id.
    async fn list_by_type(
        &self,
        account: &str,
        inventory_type: &str,
        state: Option<InventoryState>,
    ) -> DomainResult<Vec<InventoryRecord>>;

    async fn list_by_type_with_tx<'t>(
        &self,
        account: &str,
        inventory_type: &str,
        state: Option<InventoryState>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Vec<InventoryRecord>>;

    /// Insert a new active record; the id is generated here.
    async fn insert_with_tx<'t>(
        &self,
        new_record: &NewInventoryRecord,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<InventoryRecord>;

    async fn update_last_updated(&self, id: Uuid, last_updated: DateTime<Utc>) -> DomainResult<()>;

    /// Returns false when no record has this id.
    async fn update_last_updated_with_tx<'t>(
        &self,
        id: Uuid,
        last_updated: DateTime<Utc>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool>;

    /// Returns false when the record exists but was already inactive.
    async fn set_inactive(&self, id: Uuid) -> DomainResult<bool>;

    /// Only an active record changes; returns whether one did.
    async fn set_inactive_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool>;

    /// Only an inactive record changes; returns whether one did.
    async fn set_active_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool>;
}

/// SQLite implementation for ImageInventoryRepository
pub struct SqliteImageInventoryRepository {
    pool: Pool<Sqlite>,
}

impl SqliteImageInventoryRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    fn map_row_to_entity(row: InventoryRow) -> DomainResult<InventoryRecord> {
        row.into_entity()
            .map_err(|e| DomainError::Internal(format!("Failed to map image inventory row to entity: {}", e)))
    }

    fn entity_name(&self) -> &'static str {
        "image_inventory"
    }

    async fn exists_with_tx<'t>(&self, id: Uuid, tx: &mut Transaction<'t, Sqlite>) -> DomainResult<bool> {
        let count: i64 = query_scalar::<_, i64>("SELECT COUNT(*) FROM image_inventory WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(count > 0)
    }

    async fn set_state_with_tx<'t>(
        &self,
        id: Uuid,
        from: InventoryState,
        to: InventoryState,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool> {
        let result = query("UPDATE image_inventory SET state = ? WHERE id = ? AND state = ?")
            .bind(to.as_str())
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl FindById<InventoryRecord> for SqliteImageInventoryRepository {
    async fn find_by_id(&self, id: Uuid) -> DomainResult<InventoryRecord> {
        let sql = format!("{} WHERE id = ?", SELECT_COLUMNS);
        let row = query_as::<_, InventoryRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound("ImageInventory".to_string(), id))?;

        Self::map_row_to_entity(row)
    }
}

#[async_trait]
impl ImageInventoryRepository for SqliteImageInventoryRepository {
    async fn list_by_type(
        &self,
        account: &str,
        inventory_type: &str,
        state: Option<InventoryState>,
    ) -> DomainResult<Vec<InventoryRecord>> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        match self.list_by_type_with_tx(account, inventory_type, state, &mut tx).await {
            Ok(records) => { tx.commit().await.map_err(DbError::from)?; Ok(records) },
            Err(e) => { let _ = tx.rollback().await; Err(e) }
        }
    }

    async fn list_by_type_with_tx<'t>(
        &self,
        account: &str,
        inventory_type: &str,
        state: Option<InventoryState>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Vec<InventoryRecord>> {
        let sql = match state {
            Some(_) => format!(
                "{} WHERE account = ? AND inventory_type = ? AND state = ? ORDER BY created_at, id",
                SELECT_COLUMNS
            ),
            None => format!(
                "{} WHERE account = ? AND inventory_type = ? ORDER BY created_at, id",
                SELECT_COLUMNS
            ),
        };
        let mut list_query = query_as::<_, InventoryRow>(&sql)
            .bind(account)
            .bind(inventory_type);
        if let Some(state) = state {
            list_query = list_query.bind(state.as_str());
        }
        let rows = list_query.fetch_all(&mut **tx).await.map_err(DbError::from)?;

        log::debug!(
            "Loaded {} {} records for {}/{} (state filter: {:?})",
            rows.len(), self.entity_name(), account, inventory_type, state
        );

        rows.into_iter().map(Self::map_row_to_entity).collect()
    }

    async fn insert_with_tx<'t>(
        &self,
        new_record: &NewInventoryRecord,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<InventoryRecord> {
        let id = Uuid::new_v4();
        let attributes_json = serde_json::to_string(&new_record.attributes)
            .map_err(|e| DomainError::Internal(format!("Failed to serialize attributes: {}", e)))?;

        query(
            r#"INSERT INTO image_inventory (
                id, account, inventory_type, image_tag, image_repo_digest,
                attributes, state, created_at, last_updated
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#
        )
        .bind(id.to_string())
        .bind(&new_record.account)
        .bind(&new_record.inventory_type)
        .bind(&new_record.image_tag)
        .bind(&new_record.image_repo_digest)
        .bind(attributes_json)
        .bind(InventoryState::Active.as_str())
        .bind(to_db_timestamp(&new_record.created_at))
        .bind(to_db_timestamp(&new_record.last_updated))
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(InventoryRecord {
            id,
            account: new_record.account.clone(),
            inventory_type: new_record.inventory_type.clone(),
            image_tag: new_record.image_tag.clone(),
            image_repo_digest: new_record.image_repo_digest.clone(),
            attributes: new_record.attributes.clone(),
            state: InventoryState::Active,
            created_at: new_record.created_at,
            last_updated: new_record.last_updated,
        })
    }

    async fn update_last_updated(&self, id: Uuid, last_updated: DateTime<Utc>) -> DomainResult<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        match self.update_last_updated_with_tx(id, last_updated, &mut tx).await {
            Ok(true) => { tx.commit().await.map_err(DbError::from)?; Ok(()) },
            Ok(false) => {
                let _ = tx.rollback().await;
                Err(DomainError::EntityNotFound("ImageInventory".to_string(), id))
            }
            Err(e) => { let _ = tx.rollback().await; Err(e) }
        }
    }

    async fn update_last_updated_with_tx<'t>(
        &self,
        id: Uuid,
        last_updated: DateTime<Utc>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool> {
        let result = query("UPDATE image_inventory SET last_updated = ? WHERE id = ?")
            .bind(to_db_timestamp(&last_updated))
            .bind(id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_inactive(&self, id: Uuid) -> DomainResult<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let outcome = match self.set_inactive_with_tx(id, &mut tx).await {
            Ok(true) => Ok(true),
            Ok(false) => match self.exists_with_tx(id, &mut tx).await {
                Ok(true) => Ok(false),
                Ok(false) => Err(DomainError::EntityNotFound("ImageInventory".to_string(), id)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        match outcome {
            Ok(changed) => { tx.commit().await.map_err(DbError::from)?; Ok(changed) },
            Err(e) => { let _ = tx.rollback().await; Err(e) }
        }
    }

    async fn set_inactive_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool> {
        self.set_state_with_tx(id, InventoryState::Active, InventoryState::Inactive, tx).await
    }

    async fn set_active_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool> {
        self.set_state_with_tx(id, InventoryState::Inactive, InventoryState::Active, tx).await
    }
}
