use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::validation::{Validate, ValidationBuilder};
use chrono::{DateTime, Datelike, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const FIELD_IMAGE_TAG: &str = "image_tag";
pub const FIELD_IMAGE_REPO_DIGEST: &str = "image_repo_digest";
pub const FIELD_LAST_UPDATED: &str = "last_updated";

/// Reported timestamps must fall inside these years to survive an RFC 3339 round trip.
pub const MIN_REPORTED_YEAR: i32 = 0;
pub const MAX_REPORTED_YEAR: i32 = 9999;

/// Longest accepted `account` or `inventory_type`
pub const MAX_PARTITION_ID_LENGTH: usize = 255;

/// Lifecycle state of an inventory record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InventoryState {
    Active,
    Inactive,
}

impl InventoryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InventoryState::Active => "active",
            InventoryState::Inactive => "inactive",
        }
    }
}

impl Default for InventoryState {
    fn default() -> Self {
        InventoryState::Active
    }
}

impl FromStr for InventoryState {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(InventoryState::Active),
            "inactive" => Ok(InventoryState::Inactive),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "state",
                &format!("Invalid inventory state: {}", s),
            ))),
        }
    }
}

impl fmt::Display for InventoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happens when a snapshot reports a key whose record is inactive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactivationPolicy {
    /// Refresh `last_updated` only; the record stays inactive.
    LeaveInactive,
    /// Refresh `last_updated` and move the record back to active.
    Reactivate,
}

impl ReactivationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReactivationPolicy::LeaveInactive => "leave_inactive",
            ReactivationPolicy::Reactivate => "reactivate",
        }
    }

    pub fn all_variants() -> Vec<&'static str> {
        vec!["leave_inactive", "reactivate"]
    }
}

impl Default for ReactivationPolicy {
    fn default() -> Self {
        ReactivationPolicy::LeaveInactive
    }
}

impl FromStr for ReactivationPolicy {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        ValidationBuilder::new("reactivation_policy", Some(normalized.clone()))
            .one_of(&Self::all_variants(), Some("expected leave_inactive or reactivate"))
            .validate()?;
        Ok(match normalized.as_str() {
            "reactivate" => ReactivationPolicy::Reactivate,
            _ => ReactivationPolicy::LeaveInactive,
        })
    }
}

/// How entries with an empty tag and/or digest are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingKeyPolicy {
    /// Accept degraded keys (empty segments) and log a warning.
    Degrade,
    /// Reject entries where both tag and digest are missing.
    RejectEmpty,
}

impl MissingKeyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissingKeyPolicy::Degrade => "degrade",
            MissingKeyPolicy::RejectEmpty => "reject_empty",
        }
    }

    pub fn all_variants() -> Vec<&'static str> {
        vec!["degrade", "reject_empty"]
    }
}

impl Default for MissingKeyPolicy {
    fn default() -> Self {
        MissingKeyPolicy::Degrade
    }
}

impl FromStr for MissingKeyPolicy {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        ValidationBuilder::new("missing_key_policy", Some(normalized.clone()))
            .one_of(&Self::all_variants(), Some("expected degrade or reject_empty"))
            .validate()?;
        Ok(match normalized.as_str() {
            "reject_empty" => MissingKeyPolicy::RejectEmpty,
            _ => MissingKeyPolicy::Degrade,
        })
    }
}

/// Persisted image inventory record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub id: Uuid,
    pub account: String,
    pub inventory_type: String,
    pub image_tag: String,
    pub image_repo_digest: String,
    /// Collector-reported fields other than tag, digest and timestamp
    pub attributes: Map<String, Value>,
    pub state: InventoryState,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl InventoryRecord {
    pub fn is_active(&self) -> bool {
        self.state == InventoryState::Active
    }
}

/// Record about to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewInventoryRecord {
    pub account: String,
    pub inventory_type: String,
    pub image_tag: String,
    pub image_repo_digest: String,
    pub attributes: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl NewInventoryRecord {
    /// Copy every field of a snapshot entry into a new record for the partition.
    pub fn from_entry(
        account: &str,
        inventory_type: &str,
        entry: &InventoryEntry,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            account: account.to_string(),
            inventory_type: inventory_type.to_string(),
            image_tag: entry.image_tag.clone().unwrap_or_default(),
            image_repo_digest: entry.image_repo_digest.clone().unwrap_or_default(),
            attributes: entry.attributes.clone(),
            created_at: now,
            last_updated: entry.last_updated.unwrap_or(now),
        }
    }
}

/// One entry of a reported snapshot.
///
/// Deserializes from a flat JSON object. `image_tag`, `image_repo_digest` and
/// `last_updated` are lifted out; every other field is kept verbatim in
/// `attributes`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct InventoryEntry {
    pub image_tag: Option<String>,
    pub image_repo_digest: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub attributes: Map<String, Value>,
}

impl InventoryEntry {
    pub fn new(image_tag: &str, image_repo_digest: &str) -> Self {
        Self {
            image_tag: Some(image_tag.to_string()),
            image_repo_digest: Some(image_repo_digest.to_string()),
            ..Default::default()
        }
    }

    pub fn with_last_updated(mut self, last_updated: DateTime<Utc>) -> Self {
        self.last_updated = Some(last_updated);
        self
    }

    pub fn with_attribute(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }
}

impl TryFrom<Map<String, Value>> for InventoryEntry {
    type Error = ValidationError;

    fn try_from(mut fields: Map<String, Value>) -> Result<Self, Self::Error> {
        let image_tag = take_optional_string(&mut fields, FIELD_IMAGE_TAG)?;
        let image_repo_digest = take_optional_string(&mut fields, FIELD_IMAGE_REPO_DIGEST)?;
        let last_updated = match fields.remove(FIELD_LAST_UPDATED) {
            Some(value) => parse_reported_timestamp(&value)?,
            None => None,
        };

        Ok(Self {
            image_tag,
            image_repo_digest,
            last_updated,
            attributes: fields,
        })
    }
}

fn take_optional_string(
    fields: &mut Map<String, Value>,
    field: &str,
) -> Result<Option<String>, ValidationError> {
    match fields.remove(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(ValidationError::format(
            field,
            &format!("expected a string, got {}", other),
        )),
    }
}

/// Parse a collector-reported timestamp.
///
/// Accepts RFC 3339, ISO-8601 without offset (read as UTC) and Unix epoch
/// seconds (integer or fractional). `null` means "not reported". Instants
/// outside years 0000-9999 (UTC) are rejected, which also catches collectors
/// sending epoch milliseconds.
pub fn parse_reported_timestamp(value: &Value) -> Result<Option<DateTime<Utc>>, ValidationError> {
    let parsed = match value {
        Value::Null => return Ok(None),
        Value::String(s) => parse_timestamp_str(s.trim())?,
        Value::Number(n) => {
            let parsed = if let Some(secs) = n.as_i64() {
                DateTime::from_timestamp(secs, 0)
            } else {
                n.as_f64().and_then(|secs| {
                    let whole = secs.floor();
                    let nanos = ((secs - whole) * 1_000_000_000.0).round() as u32;
                    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
                })
            };
            parsed.ok_or_else(|| {
                ValidationError::format(FIELD_LAST_UPDATED, &format!("Epoch out of range: {}", n))
            })?
        }
        other => {
            return Err(ValidationError::format(
                FIELD_LAST_UPDATED,
                &format!("expected a timestamp, got {}", other),
            ))
        }
    };

    if !(MIN_REPORTED_YEAR..=MAX_REPORTED_YEAR).contains(&parsed.year()) {
        return Err(ValidationError::format(
            FIELD_LAST_UPDATED,
            &format!(
                "Timestamp {} is outside years {:04}-{:04}",
                value, MIN_REPORTED_YEAR, MAX_REPORTED_YEAR
            ),
        ));
    }
    Ok(Some(parsed))
}

fn parse_timestamp_str(s: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(ValidationError::format(
        FIELD_LAST_UPDATED,
        &format!("Unrecognized timestamp: {}", s),
    ))
}

/// Scoping identifiers of a reconcile call
#[derive(Debug, Clone)]
pub struct InventoryPartition<'a> {
    pub account: &'a str,
    pub inventory_type: &'a str,
}

impl Validate for InventoryPartition<'_> {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("account", Some(self.account.to_string()))
            .not_blank()
            .max_length(MAX_PARTITION_ID_LENGTH)
            .validate()?;
        ValidationBuilder::new("inventory_type", Some(self.inventory_type.to_string()))
            .not_blank()
            .max_length(MAX_PARTITION_ID_LENGTH)
            .validate()?;
        Ok(())
    }
}

/// Outcome of a successful reconcile call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub account: String,
    pub inventory_type: String,
    pub inserted: usize,
    pub refreshed: usize,
    pub reactivated: usize,
    pub deactivated: usize,
    /// Inactive records that were not reported and were left alone
    pub untouched_inactive: usize,
}

/// Timestamps go to SQLite in one fixed RFC 3339 shape so they sort as text.
/// Nanoseconds are kept, so a stored value reads back exactly.
pub fn to_db_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// ImageInventoryRow - SQLite row representation for mapping from database
#[derive(Debug, Clone, FromRow)]
pub struct InventoryRow {
    pub id: String,
    pub account: String,
    pub inventory_type: String,
    pub image_tag: String,
    pub image_repo_digest: String,
    pub attributes: String,
    pub state: String,
    pub created_at: String,
    pub last_updated: String,
}

impl InventoryRow {
    /// Convert database row to domain entity
    pub fn into_entity(self) -> DomainResult<InventoryRecord> {
        let parse_datetime = |s: &str, field_name: &str| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| DomainError::Validation(ValidationError::format(field_name, &format!("Invalid RFC3339 format: {}", s))))
        };

        let attributes = match serde_json::from_str::<Value>(&self.attributes) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(DomainError::Validation(ValidationError::format(
                    "attributes",
                    &format!("expected a JSON object, got {}", other),
                )))
            }
            Err(e) => {
                return Err(DomainError::Validation(ValidationError::format(
                    "attributes",
                    &format!("Invalid JSON: {}", e),
                )))
            }
        };

        Ok(InventoryRecord {
            id: Uuid::parse_str(&self.id).map_err(|_| DomainError::Validation(ValidationError::format("id", &format!("Invalid UUID format: {}", self.id))))?,
            account: self.account,
            inventory_type: self.inventory_type,
            image_tag: self.image_tag,
            image_repo_digest: self.image_repo_digest,
            attributes,
            state: InventoryState::from_str(&self.state)?,
            created_at: parse_datetime(&self.created_at, "created_at")?,
            last_updated: parse_datetime(&self.last_updated, "last_updated")?,
        })
    }
}
