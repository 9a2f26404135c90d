use crate::domains::inventory::reconciler::ReconcileOptions;
use crate::domains::inventory::types::{MissingKeyPolicy, ReactivationPolicy};
use crate::errors::{ServiceError, ServiceResult};
use std::env;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_MAX_CONNECTIONS: &str = "INVENTORY_DB_MAX_CONNECTIONS";
pub const ENV_REACTIVATION_POLICY: &str = "INVENTORY_REACTIVATION_POLICY";
pub const ENV_MISSING_KEY_POLICY: &str = "INVENTORY_MISSING_KEY_POLICY";

pub const DEFAULT_DATABASE_URL: &str = "sqlite:image_inventory.sqlite?mode=rwc";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Runtime settings for the inventory store and reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub reactivation_policy: ReactivationPolicy,
    pub missing_key_policy: MissingKeyPolicy,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            reactivation_policy: ReactivationPolicy::default(),
            missing_key_policy: MissingKeyPolicy::default(),
        }
    }
}

impl InventoryConfig {
    /// Read settings from the process environment, after loading `.env` if present.
    pub fn from_env() -> ServiceResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source. Unset or blank variables take their default.
    pub fn from_lookup<F>(lookup: F) -> ServiceResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let database_url = read(ENV_DATABASE_URL).unwrap_or(defaults.database_url);

        let max_connections = match read(ENV_MAX_CONNECTIONS) {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(n) if n >= 1 => n,
                _ => {
                    return Err(ServiceError::Configuration(format!(
                        "{} must be a positive integer, got '{}'",
                        ENV_MAX_CONNECTIONS, raw
                    )))
                }
            },
            None => defaults.max_connections,
        };

        let reactivation_policy = match read(ENV_REACTIVATION_POLICY) {
            Some(raw) => raw.parse::<ReactivationPolicy>().map_err(|e| {
                ServiceError::Configuration(format!("{}: {}", ENV_REACTIVATION_POLICY, e))
            })?,
            None => defaults.reactivation_policy,
        };

        let missing_key_policy = match read(ENV_MISSING_KEY_POLICY) {
            Some(raw) => raw.parse::<MissingKeyPolicy>().map_err(|e| {
                ServiceError::Configuration(format!("{}: {}", ENV_MISSING_KEY_POLICY, e))
            })?,
            None => defaults.missing_key_policy,
        };

        Ok(Self {
            database_url,
            max_connections,
            reactivation_policy,
            missing_key_policy,
        })
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            reactivation: self.reactivation_policy,
            missing_key: self.missing_key_policy,
        }
    }

    /// In-memory databases live only as long as their connection.
    pub fn is_in_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}
