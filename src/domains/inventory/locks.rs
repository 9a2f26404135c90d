use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type PairKey = (String, String);

/// One async mutex per (account, inventory_type).
///
/// Reconcile calls for the same pair queue up behind each other; calls for
/// different pairs never contend.
#[derive(Debug, Clone, Default)]
pub struct PairLocks {
    slots: Arc<Mutex<HashMap<PairKey, Arc<Mutex<()>>>>>,
}

impl PairLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to the pair. Released when the guard drops.
    pub async fn acquire(&self, account: &str, inventory_type: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().await;
            // Drop slots nobody holds or waits on.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots
                .entry((account.to_string(), inventory_type.to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Number of pairs currently tracked.
    pub async fn tracked(&self) -> usize {
        self.slots.lock().await.len()
    }
}
