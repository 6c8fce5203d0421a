use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::{Account, ConfigOverlay, PolicyError};

/// Read boundary over the layered configuration. Written only by the
/// externally-owned operator surface; the engine treats it as read-only
/// within an evaluation cycle.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list_accounts(&self) -> Result<Vec<Account>, PolicyError>;
    async fn global_config(&self) -> Result<Option<ConfigOverlay>, PolicyError>;
    async fn account_config(&self, account_id: i64) -> Result<Option<ConfigOverlay>, PolicyError>;
}

#[derive(Default, Debug)]
struct StoreInner {
    global: Option<ConfigOverlay>,
    accounts: Vec<Account>,
    overrides: HashMap<i64, ConfigOverlay>,
}

/// In-memory [`ConfigStore`], loaded from the accounts file at startup.
#[derive(Default, Debug)]
pub struct MemoryConfigStore {
    inner: RwLock<StoreInner>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_global(&self, config: ConfigOverlay) {
        self.inner.write().await.global = Some(config);
    }

    pub async fn upsert_account(&self, account: Account, config: Option<ConfigOverlay>) {
        let mut inner = self.inner.write().await;
        if let Some(config) = config {
            inner.overrides.insert(account.id, config);
        }
        match inner.accounts.iter_mut().find(|a| a.id == account.id) {
            Some(existing) => *existing = account,
            None => inner.accounts.push(account),
        }
    }

    pub async fn set_account_enabled(&self, account_id: i64, enabled: bool) -> bool {
        let mut inner = self.inner.write().await;
        match inner.accounts.iter_mut().find(|a| a.id == account_id) {
            Some(account) => {
                account.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Builds a store from the accounts TOML file.
    pub fn from_toml(contents: &str) -> Result<Self, PolicyError> {
        let parsed: AccountsFile =
            toml::from_str(contents).map_err(|e| PolicyError::Store(e.to_string()))?;
        let mut inner = StoreInner {
            global: Some(parsed.global),
            ..Default::default()
        };
        for entry in parsed.accounts {
            if let Some(config) = entry.config {
                inner.overrides.insert(entry.account.id, config);
            }
            inner.accounts.push(entry.account);
        }
        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    pub fn load_file(path: &Path) -> Result<Self, PolicyError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PolicyError::Store(format!("failed to read accounts file {path:?}: {e}"))
        })?;
        Self::from_toml(&contents)
    }
}

#[derive(Deserialize)]
struct AccountsFile {
    global: ConfigOverlay,
    #[serde(default, rename = "account")]
    accounts: Vec<AccountEntry>,
}

#[derive(Deserialize)]
struct AccountEntry {
    #[serde(flatten)]
    account: Account,
    config: Option<ConfigOverlay>,
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn list_accounts(&self) -> Result<Vec<Account>, PolicyError> {
        Ok(self.inner.read().await.accounts.clone())
    }

    async fn global_config(&self) -> Result<Option<ConfigOverlay>, PolicyError> {
        Ok(self.inner.read().await.global.clone())
    }

    async fn account_config(&self, account_id: i64) -> Result<Option<ConfigOverlay>, PolicyError> {
        Ok(self.inner.read().await.overrides.get(&account_id).cloned())
    }
}
