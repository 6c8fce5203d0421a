use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod store;

pub use store::{ConfigStore, MemoryConfigStore};

pub const DEFAULT_CHECK_INTERVAL_MINUTES: u64 = 5;
pub const DEFAULT_TRAFFIC_THRESHOLD_GB: f64 = 10.0;
pub const DEFAULT_SHUTDOWN_DELAY_MINUTES: u64 = 0;
pub const DEFAULT_RETRY_TIMES: u32 = 3;

fn default_enabled() -> bool {
    true
}

/// A tenant credential set. Credential encryption and the operator CRUD
/// surface live outside this process; the token is opaque here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub api_token: String,
    pub region: String,
    pub project_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Partial policy settings. Used for both the global config and account
/// overrides; `None` means "unset", so a legitimate zero (e.g. a shutdown
/// delay of 0) never doubles as a sentinel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverlay {
    pub check_interval_minutes: Option<u64>,
    pub traffic_threshold_gb: Option<f64>,
    pub auto_shutdown_enabled: Option<bool>,
    pub notification_enabled: Option<bool>,
    pub shutdown_delay_minutes: Option<u64>,
    pub retry_times: Option<u32>,
    pub webhook_url: Option<String>,
}

/// The fully-resolved policy for one evaluation cycle. Recomputed on every
/// cycle so concurrent config edits take effect on the next tick; never
/// cached across cycles.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    pub check_interval: Duration,
    pub traffic_threshold_gb: f64,
    pub auto_shutdown_enabled: bool,
    pub notification_enabled: bool,
    pub shutdown_delay: Duration,
    pub retry_times: u32,
    pub webhook_url: Option<String>,
}

impl EffectivePolicy {
    /// Field-by-field overlay merge: account value wins if set, else the
    /// global value, else the hard-coded default.
    pub fn resolve(account: Option<&ConfigOverlay>, global: &ConfigOverlay) -> Self {
        fn pick<T>(
            account: Option<&ConfigOverlay>,
            global: &ConfigOverlay,
            get: impl Fn(&ConfigOverlay) -> Option<T>,
            default: T,
        ) -> T {
            account
                .and_then(&get)
                .or_else(|| get(global))
                .unwrap_or(default)
        }

        EffectivePolicy {
            check_interval: Duration::from_secs(
                pick(
                    account,
                    global,
                    |c| c.check_interval_minutes,
                    DEFAULT_CHECK_INTERVAL_MINUTES,
                ) * 60,
            ),
            traffic_threshold_gb: pick(
                account,
                global,
                |c| c.traffic_threshold_gb,
                DEFAULT_TRAFFIC_THRESHOLD_GB,
            ),
            auto_shutdown_enabled: pick(account, global, |c| c.auto_shutdown_enabled, true),
            notification_enabled: pick(account, global, |c| c.notification_enabled, true),
            shutdown_delay: Duration::from_secs(
                pick(
                    account,
                    global,
                    |c| c.shutdown_delay_minutes,
                    DEFAULT_SHUTDOWN_DELAY_MINUTES,
                ) * 60,
            ),
            retry_times: pick(account, global, |c| c.retry_times, DEFAULT_RETRY_TIMES),
            webhook_url: account
                .and_then(|c| c.webhook_url.clone())
                .or_else(|| global.webhook_url.clone()),
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    /// The single global config is absent. Fatal to scheduling.
    #[error("global configuration is missing")]
    GlobalConfigMissing,
    #[error("unknown account: {0}")]
    UnknownAccount(i64),
    #[error("config store error: {0}")]
    Store(String),
}

/// Pure read over the config store; produces the effective policy snapshot
/// for one account.
pub struct PolicyResolver {
    store: Arc<dyn ConfigStore>,
}

impl PolicyResolver {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, account_id: i64) -> Result<EffectivePolicy, PolicyError> {
        let global = self
            .store
            .global_config()
            .await?
            .ok_or(PolicyError::GlobalConfigMissing)?;
        let account = self.store.account_config(account_id).await?;
        Ok(EffectivePolicy::resolve(account.as_ref(), &global))
    }
}
