//! Diff computation between the stored partition and an incoming snapshot.
//!
//! Nothing here touches the database: [`plan_reconciliation`] turns the
//! existing records and the snapshot into a [`ReconciliationPlan`], which the
//! service applies inside one transaction.

use crate::domains::inventory::identity::{build_key, build_record_key, MatchingKey};
use crate::domains::inventory::types::{
    InventoryEntry, InventoryRecord, InventoryState, MissingKeyPolicy, NewInventoryRecord,
    ReactivationPolicy, ReconcileSummary,
};
use crate::errors::{DomainError, DomainResult, ValidationError};
use chrono::{DateTime, Utc};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use uuid::Uuid;

/// Policies applied while planning
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub reactivation: ReactivationPolicy,
    pub missing_key: MissingKeyPolicy,
}

/// Inputs shared by every step of one plan
#[derive(Debug, Clone)]
pub struct ReconcileContext<'a> {
    pub account: &'a str,
    pub inventory_type: &'a str,
    /// Reconciliation time; the fallback for entries without `last_updated`
    pub now: DateTime<Utc>,
    pub options: ReconcileOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampRefresh {
    pub id: Uuid,
    pub last_updated: DateTime<Utc>,
}

/// Ordered persistence operations for one reconcile call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationPlan {
    /// In order of first appearance in the snapshot
    pub inserts: Vec<NewInventoryRecord>,
    pub refreshes: Vec<TimestampRefresh>,
    pub reactivations: Vec<Uuid>,
    /// In load order of the existing records
    pub deactivations: Vec<Uuid>,
    pub untouched_inactive: usize,
}

impl ReconciliationPlan {
    pub fn summary(&self, account: &str, inventory_type: &str) -> ReconcileSummary {
        ReconcileSummary {
            account: account.to_string(),
            inventory_type: inventory_type.to_string(),
            inserted: self.inserts.len(),
            refreshed: self.refreshes.len(),
            reactivated: self.reactivations.len(),
            deactivated: self.deactivations.len(),
            untouched_inactive: self.untouched_inactive,
        }
    }
}

/// Check every entry against the missing-key policy.
///
/// Runs before the store is touched so bad snapshots are rejected early.
pub fn check_entries(entries: &[InventoryEntry], policy: MissingKeyPolicy) -> DomainResult<()> {
    if policy != MissingKeyPolicy::RejectEmpty {
        return Ok(());
    }
    match entries.iter().position(|entry| build_key(entry).is_empty()) {
        Some(index) => Err(DomainError::Validation(ValidationError::entity(&format!(
            "snapshot entry {} has neither image_tag nor image_repo_digest",
            index
        )))),
        None => Ok(()),
    }
}

/// Index stored records by matching key.
///
/// Two records sharing a key break the one-record-per-key invariant and are
/// reported rather than resolved.
pub fn index_existing(
    account: &str,
    inventory_type: &str,
    records: Vec<InventoryRecord>,
) -> DomainResult<HashMap<MatchingKey, InventoryRecord>> {
    let mut index: HashMap<MatchingKey, InventoryRecord> = HashMap::with_capacity(records.len());
    let mut conflicts: HashMap<MatchingKey, Vec<Uuid>> = HashMap::new();

    for record in records {
        match index.entry(build_record_key(&record)) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(slot) => {
                conflicts
                    .entry(slot.key().clone())
                    .or_insert_with(|| vec![slot.get().id])
                    .push(record.id);
            }
        }
    }

    if let Some((key, record_ids)) = conflicts.into_iter().min_by(|a, b| a.0.cmp(&b.0)) {
        return Err(DomainError::AmbiguousIdentity {
            account: account.to_string(),
            inventory_type: inventory_type.to_string(),
            key: key.to_key_string(),
            record_ids,
        });
    }

    Ok(index)
}

/// Compute the operations that make the partition match `snapshot`.
///
/// Matched keys get their timestamp refreshed, unknown keys are inserted and
/// active records left unreported are deactivated. A key repeated within the
/// snapshot is last-write-wins: the later entry replaces the pending insert,
/// or the pending refresh timestamp, produced by the earlier one.
///
/// `snapshot` must already have passed [`check_entries`].
pub fn plan_reconciliation(
    existing: Vec<InventoryRecord>,
    snapshot: &[InventoryEntry],
    ctx: &ReconcileContext<'_>,
) -> DomainResult<ReconciliationPlan> {
    let mut unseen = index_existing(ctx.account, ctx.inventory_type, existing)?;
    let mut plan = ReconciliationPlan::default();
    let mut refreshed_at: HashMap<MatchingKey, usize> = HashMap::new();
    let mut inserted_at: HashMap<MatchingKey, usize> = HashMap::new();

    for entry in snapshot {
        let key = build_key(entry);
        if key.is_degraded() {
            log::warn!(
                "Degraded matching key {} in {}/{}: image_tag or image_repo_digest missing",
                key, ctx.account, ctx.inventory_type
            );
        }
        let last_updated = entry.last_updated.unwrap_or(ctx.now);

        if let Some(record) = unseen.remove(&key) {
            plan.refreshes.push(TimestampRefresh { id: record.id, last_updated });
            if record.state == InventoryState::Inactive
                && ctx.options.reactivation == ReactivationPolicy::Reactivate
            {
                plan.reactivations.push(record.id);
            }
            refreshed_at.insert(key, plan.refreshes.len() - 1);
        } else if let Some(&index) = refreshed_at.get(&key) {
            log::debug!("Key {} repeated in snapshot; keeping the later timestamp", key);
            plan.refreshes[index].last_updated = last_updated;
        } else if let Some(&index) = inserted_at.get(&key) {
            log::debug!("Key {} repeated in snapshot; keeping the later entry", key);
            plan.inserts[index] = NewInventoryRecord::from_entry(ctx.account, ctx.inventory_type, entry, ctx.now);
        } else {
            plan.inserts.push(NewInventoryRecord::from_entry(ctx.account, ctx.inventory_type, entry, ctx.now));
            inserted_at.insert(key, plan.inserts.len() - 1);
        }
    }

    // Whatever is left was not reported this round.
    let mut remaining: Vec<(MatchingKey, InventoryRecord)> = unseen.into_iter().collect();
    remaining.sort_by(|a, b| (a.1.created_at, a.1.id).cmp(&(b.1.created_at, b.1.id)));

    for (key, record) in remaining {
        match record.state {
            InventoryState::Active => {
                log::debug!("Key {} not reported; marking record {} inactive", key, record.id);
                plan.deactivations.push(record.id);
            }
            InventoryState::Inactive => plan.untouched_inactive += 1,
        }
    }

    Ok(plan)
}
