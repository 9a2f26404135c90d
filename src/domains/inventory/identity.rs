//! Matching keys for inventory entries.
//!
//! Collectors do not report a stable identifier, so an entry is recognised
//! across snapshots by its (image tag, repo digest) pair.

use crate::domains::inventory::types::{InventoryEntry, InventoryRecord};
use serde::Serialize;
use std::fmt;

/// Composite identity of an image within one (account, inventory_type) partition.
///
/// Ordering and equality are field-wise, tag first. Either segment may be
/// empty when the collector omitted the field; see [`MatchingKey::is_degraded`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MatchingKey {
    image_tag: String,
    image_repo_digest: String,
}

impl MatchingKey {
    pub fn new(image_tag: impl Into<String>, image_repo_digest: impl Into<String>) -> Self {
        Self {
            image_tag: image_tag.into(),
            image_repo_digest: image_repo_digest.into(),
        }
    }

    pub fn image_tag(&self) -> &str {
        &self.image_tag
    }

    pub fn image_repo_digest(&self) -> &str {
        &self.image_repo_digest
    }

    /// At least one segment is empty. Unrelated entries missing the same
    /// field can collide on a degraded key.
    pub fn is_degraded(&self) -> bool {
        self.image_tag.is_empty() || self.image_repo_digest.is_empty()
    }

    /// Both segments are empty.
    pub fn is_empty(&self) -> bool {
        self.image_tag.is_empty() && self.image_repo_digest.is_empty()
    }

    /// Canonical string form, `<tag length>:<tag><digest>`.
    ///
    /// The length prefix keeps the encoding injective whatever characters the
    /// segments contain.
    pub fn to_key_string(&self) -> String {
        format!("{}:{}{}", self.image_tag.len(), self.image_tag, self.image_repo_digest)
    }
}

impl fmt::Display for MatchingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key_string())
    }
}

/// Key of an incoming snapshot entry; absent fields become empty segments.
pub fn build_key(entry: &InventoryEntry) -> MatchingKey {
    MatchingKey::new(
        entry.image_tag.as_deref().unwrap_or_default(),
        entry.image_repo_digest.as_deref().unwrap_or_default(),
    )
}

/// Key of a persisted record.
pub fn build_record_key(record: &InventoryRecord) -> MatchingKey {
    MatchingKey::new(record.image_tag.as_str(), record.image_repo_digest.as_str())
}
