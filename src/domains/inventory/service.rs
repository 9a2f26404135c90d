use crate::domains::inventory::locks::PairLocks;
use crate::domains::inventory::reconciler::{
    check_entries, plan_reconciliation, ReconcileContext, ReconcileOptions, ReconciliationPlan,
};
use crate::domains::inventory::repository::ImageInventoryRepository;
use crate::domains::inventory::types::{
    InventoryEntry, InventoryPartition, InventoryRecord, InventoryState, ReconcileSummary,
};
use crate::errors::{DbError, DomainError, ServiceError, ServiceResult};
use crate::validation::Validate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::sync::Arc;

/// Trait defining image inventory service operations
#[async_trait]
pub trait ImageInventoryService: Send + Sync {
    /// Make the stored partition match `snapshot`.
    ///
    /// Either every change is committed or none is. Calls for the same
    /// (account, inventory_type) run one at a time.
    async fn reconcile(
        &self,
        account: &str,
        inventory_type: &str,
        snapshot: Vec<InventoryEntry>,
    ) -> ServiceResult<ReconcileSummary>;

    /// Same as `reconcile`, inside a transaction the caller commits or rolls
    /// back. The caller is responsible for serializing calls on the pair.
    async fn reconcile_with_tx<'t>(
        &self,
        account: &str,
        inventory_type: &str,
        snapshot: &[InventoryEntry],
        now: DateTime<Utc>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> ServiceResult<ReconcileSummary>;

    async fn list_inventory(
        &self,
        account: &str,
        inventory_type: &str,
        state: Option<InventoryState>,
    ) -> ServiceResult<Vec<InventoryRecord>>;
}

/// Implementation of the image inventory service
#[derive(Clone)]
pub struct ImageInventoryServiceImpl {
    pool: SqlitePool,
    repo: Arc<dyn ImageInventoryRepository>,
    options: ReconcileOptions,
    locks: PairLocks,
}

impl ImageInventoryServiceImpl {
    pub fn new(
        pool: SqlitePool,
        repo: Arc<dyn ImageInventoryRepository>,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            pool,
            repo,
            options,
            locks: PairLocks::new(),
        }
    }

    fn validate_request(
        &self,
        account: &str,
        inventory_type: &str,
        snapshot: &[InventoryEntry],
    ) -> ServiceResult<()> {
        InventoryPartition { account, inventory_type }.validate()?;
        check_entries(snapshot, self.options.missing_key)?;
        Ok(())
    }

    /// Load, plan and apply. Expects a request already checked by `validate_request`.
    async fn apply_in_tx<'t>(
        &self,
        account: &str,
        inventory_type: &str,
        snapshot: &[InventoryEntry],
        now: DateTime<Utc>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> ServiceResult<ReconcileSummary> {
        let existing = self
            .repo
            .list_by_type_with_tx(account, inventory_type, None, tx)
            .await?;
        log::debug!(
            "Reconciling {} snapshot entries against {} stored records for {}/{}",
            snapshot.len(),
            existing.len(),
            account,
            inventory_type
        );

        let ctx = ReconcileContext {
            account,
            inventory_type,
            now,
            options: self.options,
        };
        let plan = match plan_reconciliation(existing, snapshot, &ctx) {
            Ok(plan) => plan,
            Err(e @ DomainError::AmbiguousIdentity { .. }) => {
                log::warn!("Refusing to reconcile {}/{}: {}", account, inventory_type, e);
                return Err(ServiceError::Domain(e));
            }
            Err(e) => return Err(e.into()),
        };

        self.apply_plan(&plan, tx).await?;
        Ok(plan.summary(account, inventory_type))
    }

    async fn apply_plan<'t>(
        &self,
        plan: &ReconciliationPlan,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> ServiceResult<()> {
        for new_record in &plan.inserts {
            let record = self.repo.insert_with_tx(new_record, tx).await?;
            log::debug!("Inserted image inventory record {} ({}, {})", record.id, record.image_tag, record.image_repo_digest);
        }

        for refresh in &plan.refreshes {
            let updated = self
                .repo
                .update_last_updated_with_tx(refresh.id, refresh.last_updated, tx)
                .await?;
            if !updated {
                // The record was loaded in this transaction; losing it means
                // something outside the pair lock wrote to the table.
                return Err(DomainError::Database(DbError::NotFound(
                    "image_inventory".to_string(),
                    refresh.id.to_string(),
                ))
                .into());
            }
        }

        for id in &plan.reactivations {
            if !self.repo.set_active_with_tx(*id, tx).await? {
                log::warn!("Record {} was not inactive when reactivating", id);
            }
        }

        for id in &plan.deactivations {
            if !self.repo.set_inactive_with_tx(*id, tx).await? {
                log::warn!("Record {} was already inactive when deactivating", id);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ImageInventoryService for ImageInventoryServiceImpl {
    async fn reconcile(
        &self,
        account: &str,
        inventory_type: &str,
        snapshot: Vec<InventoryEntry>,
    ) -> ServiceResult<ReconcileSummary> {
        self.validate_request(account, inventory_type, &snapshot)?;

        let _pair_guard = self.locks.acquire(account, inventory_type).await;
        let now = Utc::now();

        // Take the write lock up front. A deferred transaction reads first and
        // then fails to upgrade while another pair's reconcile holds SHARED.
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(DbError::from)?;
        match self.apply_in_tx(account, inventory_type, &snapshot, now, &mut tx).await {
            Ok(summary) => {
                tx.commit().await.map_err(DbError::from)?;
                log::info!(
                    "Reconciled {}/{}: {} inserted, {} refreshed, {} reactivated, {} deactivated, {} inactive untouched",
                    account,
                    inventory_type,
                    summary.inserted,
                    summary.refreshed,
                    summary.reactivated,
                    summary.deactivated,
                    summary.untouched_inactive
                );
                Ok(summary)
            }
            Err(e) => {
                log::error!("Reconcile of {}/{} failed, rolling back: {}", account, inventory_type, e);
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn reconcile_with_tx<'t>(
        &self,
        account: &str,
        inventory_type: &str,
        snapshot: &[InventoryEntry],
        now: DateTime<Utc>,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> ServiceResult<ReconcileSummary> {
        self.validate_request(account, inventory_type, snapshot)?;
        self.apply_in_tx(account, inventory_type, snapshot, now, tx).await
    }

    async fn list_inventory(
        &self,
        account: &str,
        inventory_type: &str,
        state: Option<InventoryState>,
    ) -> ServiceResult<Vec<InventoryRecord>> {
        InventoryPartition { account, inventory_type }.validate()?;
        Ok(self.repo.list_by_type(account, inventory_type, state).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::core::repository::FindById;
    use crate::domains::inventory::repository::SqliteImageInventoryRepository;
    use crate::domains::inventory::test_support::migrated_memory_pool;
    use crate::domains::inventory::types::{MissingKeyPolicy, NewInventoryRecord, ReactivationPolicy};
    use crate::errors::{DomainResult, ValidationError};
    use chrono::TimeZone;
    use serde_json::json;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use uuid::Uuid;

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    fn service_with(pool: SqlitePool, options: ReconcileOptions) -> ImageInventoryServiceImpl {
        let repo = Arc::new(SqliteImageInventoryRepository::new(pool.clone()));
        ImageInventoryServiceImpl::new(pool, repo, options)
    }

    async fn default_service() -> ImageInventoryServiceImpl {
        service_with(migrated_memory_pool().await, ReconcileOptions::default())
    }

    fn find<'a>(records: &'a [InventoryRecord], tag: &str) -> &'a InventoryRecord {
        records
            .iter()
            .find(|r| r.image_tag == tag)
            .unwrap_or_else(|| panic!("no record tagged {}", tag))
    }

    #[tokio::test]
    async fn test_first_snapshot_populates_partition() {
        let service = default_service().await;
        let snapshot = vec![
            InventoryEntry::new("app:1.0", "sha256:aaa")
                .with_last_updated(t(1))
                .with_attribute("namespace", json!("web")),
            InventoryEntry::new("db:2.0", "sha256:bbb").with_last_updated(t(1)),
        ];

        let summary = service.reconcile("acme", "kubernetes", snapshot).await.unwrap();
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.deactivated, 0);

        let records = service.list_inventory("acme", "kubernetes", None).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.is_active()));
        assert_eq!(find(&records, "app:1.0").attributes["namespace"], json!("web"));
        assert_eq!(find(&records, "db:2.0").last_updated, t(1));
    }

    #[tokio::test]
    async fn test_followup_snapshot_refreshes_inserts_and_deactivates() {
        let service = default_service().await;
        service
            .reconcile(
                "acme",
                "kubernetes",
                vec![
                    InventoryEntry::new("app:1.0", "sha256:aaa").with_last_updated(t(1)),
                    InventoryEntry::new("db:2.0", "sha256:bbb").with_last_updated(t(1)),
                ],
            )
            .await
            .unwrap();

        let summary = service
            .reconcile(
                "acme",
                "kubernetes",
                vec![
                    InventoryEntry::new("app:1.0", "sha256:aaa").with_last_updated(t(2)),
                    InventoryEntry::new("cache:3.0", "sha256:ccc").with_last_updated(t(2)),
                ],
            )
            .await
            .unwrap();

        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.refreshed, 1);
        assert_eq!(summary.deactivated, 1);

        let records = service.list_inventory("acme", "kubernetes", None).await.unwrap();
        assert_eq!(records.len(), 3);
        let app = find(&records, "app:1.0");
        assert!(app.is_active());
        assert_eq!(app.last_updated, t(2));
        let db = find(&records, "db:2.0");
        assert_eq!(db.state, InventoryState::Inactive);
        assert_eq!(db.last_updated, t(1));
        assert!(find(&records, "cache:3.0").is_active());
    }

    #[tokio::test]
    async fn test_same_snapshot_twice_is_stable() {
        let service = default_service().await;
        let snapshot = vec![
            InventoryEntry::new("app:1.0", "sha256:aaa").with_last_updated(t(1)),
            InventoryEntry::new("db:2.0", "sha256:bbb").with_last_updated(t(1)),
        ];

        service.reconcile("acme", "kubernetes", snapshot.clone()).await.unwrap();
        let before = service.list_inventory("acme", "kubernetes", None).await.unwrap();

        let summary = service.reconcile("acme", "kubernetes", snapshot).await.unwrap();
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.deactivated, 0);
        assert_eq!(summary.refreshed, 2);

        let after = service.list_inventory("acme", "kubernetes", None).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_missing_timestamp_defaults_to_reconcile_time() {
        let service = default_service().await;
        let started = Utc::now();
        service
            .reconcile("acme", "kubernetes", vec![InventoryEntry::new("app:1.0", "sha256:aaa")])
            .await
            .unwrap();

        let records = service.list_inventory("acme", "kubernetes", None).await.unwrap();
        assert!(records[0].last_updated >= started);
        assert!(records[0].last_updated <= Utc::now());
    }

    #[tokio::test]
    async fn test_empty_snapshot_deactivates_partition_only() {
        let service = default_service().await;
        service
            .reconcile("acme", "kubernetes", vec![InventoryEntry::new("app:1.0", "sha256:aaa")])
            .await
            .unwrap();
        service
            .reconcile("acme", "ecs", vec![InventoryEntry::new("app:1.0", "sha256:aaa")])
            .await
            .unwrap();
        service
            .reconcile("globex", "kubernetes", vec![InventoryEntry::new("app:1.0", "sha256:aaa")])
            .await
            .unwrap();

        let summary = service.reconcile("acme", "kubernetes", Vec::new()).await.unwrap();
        assert_eq!(summary.deactivated, 1);

        let k8s = service.list_inventory("acme", "kubernetes", None).await.unwrap();
        assert!(k8s.iter().all(|r| r.state == InventoryState::Inactive));
        let ecs = service.list_inventory("acme", "ecs", Some(InventoryState::Active)).await.unwrap();
        assert_eq!(ecs.len(), 1);
        let globex = service.list_inventory("globex", "kubernetes", Some(InventoryState::Active)).await.unwrap();
        assert_eq!(globex.len(), 1);

        // Nothing left to deactivate.
        let again = service.reconcile("acme", "kubernetes", Vec::new()).await.unwrap();
        assert_eq!(again.deactivated, 0);
        assert_eq!(again.untouched_inactive, 1);
    }

    #[tokio::test]
    async fn test_reappearing_image_stays_inactive_by_default() {
        let service = default_service().await;
        let entry = InventoryEntry::new("app:1.0", "sha256:aaa");
        service.reconcile("acme", "kubernetes", vec![entry.clone()]).await.unwrap();
        service.reconcile("acme", "kubernetes", Vec::new()).await.unwrap();

        let summary = service
            .reconcile("acme", "kubernetes", vec![entry.with_last_updated(t(7))])
            .await
            .unwrap();
        assert_eq!(summary.inserted, 0);
        assert_eq!(summary.refreshed, 1);
        assert_eq!(summary.reactivated, 0);

        let records = service.list_inventory("acme", "kubernetes", None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, InventoryState::Inactive);
        assert_eq!(records[0].last_updated, t(7));
    }

    #[tokio::test]
    async fn test_reappearing_image_is_reactivated_when_configured() {
        let options = ReconcileOptions {
            reactivation: ReactivationPolicy::Reactivate,
            ..Default::default()
        };
        let service = service_with(migrated_memory_pool().await, options);
        let entry = InventoryEntry::new("app:1.0", "sha256:aaa");
        service.reconcile("acme", "kubernetes", vec![entry.clone()]).await.unwrap();
        service.reconcile("acme", "kubernetes", Vec::new()).await.unwrap();

        let summary = service.reconcile("acme", "kubernetes", vec![entry]).await.unwrap();
        assert_eq!(summary.reactivated, 1);

        let records = service.list_inventory("acme", "kubernetes", None).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_active());
    }

    #[tokio::test]
    async fn test_ambiguous_store_is_rejected_without_changes() {
        let pool = migrated_memory_pool().await;
        let repo = SqliteImageInventoryRepository::new(pool.clone());
        let entry = InventoryEntry::new("app:1.0", "sha256:aaa");
        let mut tx = pool.begin().await.unwrap();
        for hour in [1, 2] {
            let new_record = NewInventoryRecord::from_entry("acme", "kubernetes", &entry, t(hour));
            repo.insert_with_tx(&new_record, &mut tx).await.unwrap();
        }
        let other = NewInventoryRecord::from_entry("acme", "kubernetes", &InventoryEntry::new("db:2.0", "sha256:bbb"), t(3));
        repo.insert_with_tx(&other, &mut tx).await.unwrap();
        tx.commit().await.unwrap();

        let service = service_with(pool, ReconcileOptions::default());
        let result = service.reconcile("acme", "kubernetes", Vec::new()).await;
        assert!(matches!(
            result,
            Err(ServiceError::Domain(DomainError::AmbiguousIdentity { ref record_ids, .. })) if record_ids.len() == 2
        ));

        let active = service.list_inventory("acme", "kubernetes", Some(InventoryState::Active)).await.unwrap();
        assert_eq!(active.len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_requests_never_reach_the_store() {
        let options = ReconcileOptions {
            missing_key: MissingKeyPolicy::RejectEmpty,
            ..Default::default()
        };
        let service = service_with(migrated_memory_pool().await, options);

        let blank_account = service.reconcile("  ", "kubernetes", Vec::new()).await;
        assert!(matches!(
            blank_account,
            Err(ServiceError::Domain(DomainError::Validation(ValidationError::Required { ref field }))) if field == "account"
        ));

        let blank_type = service.reconcile("acme", "", Vec::new()).await;
        assert!(matches!(
            blank_type,
            Err(ServiceError::Domain(DomainError::Validation(ValidationError::Required { ref field }))) if field == "inventory_type"
        ));

        let keyless = service
            .reconcile(
                "acme",
                "kubernetes",
                vec![
                    InventoryEntry::new("app:1.0", "sha256:aaa"),
                    InventoryEntry::default(),
                ],
            )
            .await;
        assert!(matches!(keyless, Err(ServiceError::Domain(DomainError::Validation(_)))));

        // The valid entry of the rejected snapshot was not stored either.
        assert!(service.list_inventory("acme", "kubernetes", None).await.unwrap().is_empty());
    }

    /// Delegates to SQLite but fails every deactivation.
    struct FailingDeactivationRepository {
        inner: SqliteImageInventoryRepository,
    }

    #[async_trait]
    impl FindById<InventoryRecord> for FailingDeactivationRepository {
        async fn find_by_id(&self, id: Uuid) -> DomainResult<InventoryRecord> {
            self.inner.find_by_id(id).await
        }
    }

    #[async_trait]
    impl ImageInventoryRepository for FailingDeactivationRepository {
        async fn list_by_type(
            &self,
            account: &str,
            inventory_type: &str,
            state: Option<InventoryState>,
        ) -> DomainResult<Vec<InventoryRecord>> {
            self.inner.list_by_type(account, inventory_type, state).await
        }

        async fn list_by_type_with_tx<'t>(
            &self,
            account: &str,
            inventory_type: &str,
            state: Option<InventoryState>,
            tx: &mut Transaction<'t, Sqlite>,
        ) -> DomainResult<Vec<InventoryRecord>> {
            self.inner.list_by_type_with_tx(account, inventory_type, state, tx).await
        }

        async fn insert_with_tx<'t>(
            &self,
            new_record: &NewInventoryRecord,
            tx: &mut Transaction<'t, Sqlite>,
        ) -> DomainResult<InventoryRecord> {
            self.inner.insert_with_tx(new_record, tx).await
        }

        async fn update_last_updated(&self, id: Uuid, last_updated: DateTime<Utc>) -> DomainResult<()> {
            self.inner.update_last_updated(id, last_updated).await
        }

        async fn update_last_updated_with_tx<'t>(
            &self,
            id: Uuid,
            last_updated: DateTime<Utc>,
            tx: &mut Transaction<'t, Sqlite>,
        ) -> DomainResult<bool> {
            self.inner.update_last_updated_with_tx(id, last_updated, tx).await
        }

        async fn set_inactive(&self, id: Uuid) -> DomainResult<bool> {
            self.inner.set_inactive(id).await
        }

        async fn set_inactive_with_tx<'t>(
            &self,
            _id: Uuid,
            _tx: &mut Transaction<'t, Sqlite>,
        ) -> DomainResult<bool> {
            Err(DomainError::Database(DbError::Query("disk I/O error".to_string())))
        }

        async fn set_active_with_tx<'t>(
            &self,
            id: Uuid,
            tx: &mut Transaction<'t, Sqlite>,
        ) -> DomainResult<bool> {
            self.inner.set_active_with_tx(id, tx).await
        }
    }

    #[tokio::test]
    async fn test_failure_mid_apply_rolls_everything_back() {
        let pool = migrated_memory_pool().await;
        let healthy = service_with(pool.clone(), ReconcileOptions::default());
        healthy
            .reconcile(
                "acme",
                "kubernetes",
                vec![
                    InventoryEntry::new("app:1.0", "sha256:aaa").with_last_updated(t(1)),
                    InventoryEntry::new("db:2.0", "sha256:bbb").with_last_updated(t(1)),
                ],
            )
            .await
            .unwrap();

        let failing = ImageInventoryServiceImpl::new(
            pool.clone(),
            Arc::new(FailingDeactivationRepository {
                inner: SqliteImageInventoryRepository::new(pool.clone()),
            }),
            ReconcileOptions::default(),
        );
        let result = failing
            .reconcile(
                "acme",
                "kubernetes",
                vec![
                    InventoryEntry::new("app:1.0", "sha256:aaa").with_last_updated(t(5)),
                    InventoryEntry::new("cache:3.0", "sha256:ccc").with_last_updated(t(5)),
                ],
            )
            .await;
        assert!(matches!(result, Err(ServiceError::Domain(DomainError::Database(_)))));

        let records = healthy.list_inventory("acme", "kubernetes", None).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.is_active() && r.last_updated == t(1)));
    }

    #[tokio::test]
    async fn test_caller_owned_transaction_still_validates_the_request() {
        let options = ReconcileOptions {
            missing_key: MissingKeyPolicy::RejectEmpty,
            ..Default::default()
        };
        let pool = migrated_memory_pool().await;
        let service = service_with(pool.clone(), options);

        let mut tx = pool.begin().await.unwrap();
        let blank = service.reconcile_with_tx(" ", "kubernetes", &[], t(3), &mut tx).await;
        assert!(matches!(
            blank,
            Err(ServiceError::Domain(DomainError::Validation(ValidationError::Required { ref field }))) if field == "account"
        ));

        let keyless = service
            .reconcile_with_tx("acme", "kubernetes", &[InventoryEntry::default()], t(3), &mut tx)
            .await;
        assert!(matches!(
            keyless,
            Err(ServiceError::Domain(DomainError::Validation(ValidationError::Entity(_))))
        ));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_nanosecond_timestamps_are_stored_exactly() {
        let service = default_service().await;
        let reported = t(4) + chrono::Duration::nanoseconds(123_456_789);
        service
            .reconcile(
                "acme",
                "kubernetes",
                vec![InventoryEntry::new("app:1.0", "sha256:aaa").with_last_updated(reported)],
            )
            .await
            .unwrap();

        let records = service.list_inventory("acme", "kubernetes", None).await.unwrap();
        assert_eq!(records[0].last_updated, reported);

        // A second identical run refreshes to the same instant.
        service
            .reconcile(
                "acme",
                "kubernetes",
                vec![InventoryEntry::new("app:1.0", "sha256:aaa").with_last_updated(reported)],
            )
            .await
            .unwrap();
        let again = service.list_inventory("acme", "kubernetes", None).await.unwrap();
        assert_eq!(again, records);
    }

    #[tokio::test]
    async fn test_caller_owned_transaction_can_discard_the_reconcile() {
        let pool = migrated_memory_pool().await;
        let service = service_with(pool.clone(), ReconcileOptions::default());

        let mut tx = pool.begin().await.unwrap();
        let summary = service
            .reconcile_with_tx(
                "acme",
                "kubernetes",
                &[InventoryEntry::new("app:1.0", "sha256:aaa")],
                t(3),
                &mut tx,
            )
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
        tx.rollback().await.unwrap();

        assert!(service.list_inventory("acme", "kubernetes", None).await.unwrap().is_empty());
    }

    /// File-backed pool; keep the returned directory alive for the test's duration.
    async fn file_backed_pool(max_connections: u32) -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let options = SqliteConnectOptions::new()
            .filename(dir.path().join("inventory.sqlite"))
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .unwrap();
        crate::db_migration::initialize_database(&pool).await.unwrap();
        (dir, pool)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reconciles_of_different_pairs_all_succeed() {
        let (_dir, pool) = file_backed_pool(8).await;
        let service = Arc::new(service_with(pool, ReconcileOptions::default()));

        let snapshot_a = vec![
            InventoryEntry::new("app:1.0", "sha256:aaa"),
            InventoryEntry::new("db:2.0", "sha256:bbb"),
        ];
        let snapshot_b = vec![
            InventoryEntry::new("app:1.0", "sha256:aaa"),
            InventoryEntry::new("cache:3.0", "sha256:ccc"),
        ];

        let mut handles = Vec::new();
        for round in 0..40 {
            let service = Arc::clone(&service);
            let inventory_type = format!("cluster-{}", round % 8);
            let snapshot = if (round / 8) % 2 == 0 { snapshot_a.clone() } else { snapshot_b.clone() };
            handles.push(tokio::spawn(async move {
                service.reconcile("acme", &inventory_type, snapshot).await
            }));
        }

        let mut failures = Vec::new();
        for handle in handles {
            if let Err(e) = handle.await.unwrap() {
                failures.push(e.to_string());
            }
        }
        assert!(failures.is_empty(), "reconciles failed: {:?}", failures);

        for cluster in 0..8 {
            let inventory_type = format!("cluster-{}", cluster);
            let records = service.list_inventory("acme", &inventory_type, None).await.unwrap();
            assert_eq!(records.len(), 3, "{}", inventory_type);
            assert_eq!(records.iter().filter(|r| r.is_active()).count(), 2, "{}", inventory_type);
        }
    }

    #[tokio::test]
    async fn test_concurrent_reconciles_of_one_pair_serialize() {
        let (_dir, pool) = file_backed_pool(4).await;
        let service = Arc::new(service_with(pool, ReconcileOptions::default()));

        let snapshot_a = vec![
            InventoryEntry::new("app:1.0", "sha256:aaa"),
            InventoryEntry::new("db:2.0", "sha256:bbb"),
        ];
        let snapshot_b = vec![
            InventoryEntry::new("app:1.0", "sha256:aaa"),
            InventoryEntry::new("cache:3.0", "sha256:ccc"),
        ];

        let mut handles = Vec::new();
        for round in 0..6 {
            let service = Arc::clone(&service);
            let snapshot = if round % 2 == 0 { snapshot_a.clone() } else { snapshot_b.clone() };
            handles.push(tokio::spawn(async move {
                service.reconcile("acme", "kubernetes", snapshot).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let records = service.list_inventory("acme", "kubernetes", None).await.unwrap();
        // Each key stored exactly once whatever the interleaving.
        assert_eq!(records.len(), 3);
        let active: Vec<&str> = records
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.image_tag.as_str())
            .collect();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&"app:1.0"));
    }
}
