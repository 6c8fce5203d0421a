use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    /// Path to the accounts TOML file (global config plus per-account
    /// credentials and overrides).
    pub accounts_file: String,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Provider endpoint template with a `{region}` placeholder.
    #[serde(default = "default_provider_endpoint")]
    pub provider_endpoint: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: String,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialServerConfig {
    accounts_file: Option<String>,
    listen_addr: Option<String>,
    provider_endpoint: Option<String>,
    request_timeout_secs: Option<u64>,
    log_dir: Option<String>,
    audit_log_path: Option<String>,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_provider_endpoint() -> String {
    "https://ecs.{region}.myhuaweicloud.com".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_audit_log_path() -> String {
    "data/audit.jsonl".to_string()
}

impl PartialServerConfig {
    fn from_env() -> Self {
        Self {
            accounts_file: env::var("ACCOUNTS_FILE").ok(),
            listen_addr: env::var("LISTEN_ADDR").ok(),
            provider_endpoint: env::var("PROVIDER_ENDPOINT").ok(),
            request_timeout_secs: env::var("REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
            log_dir: env::var("LOG_DIR").ok(),
            audit_log_path: env::var("AUDIT_LOG_PATH").ok(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, String> {
        dotenv::dotenv().ok();

        // 1. Load from file (optional)
        let file_config: PartialServerConfig = if let Some(path_str) = config_path {
            let path = Path::new(path_str);
            if path.exists() {
                let contents = fs::read_to_string(path)
                    .map_err(|e| format!("Failed to read config file at {path:?}: {e}"))?;
                toml::from_str(&contents)
                    .map_err(|e| format!("Failed to parse TOML from config file at {path:?}: {e}"))?
            } else {
                PartialServerConfig::default()
            }
        } else {
            PartialServerConfig::default()
        };

        // 2. Load from environment variables
        let env_config = PartialServerConfig::from_env();

        // 3. Merge: environment overrides file
        let final_config = ServerConfig {
            accounts_file: env_config
                .accounts_file
                .or(file_config.accounts_file)
                .ok_or("ACCOUNTS_FILE is required")?,
            listen_addr: env_config
                .listen_addr
                .or(file_config.listen_addr)
                .unwrap_or_else(default_listen_addr),
            provider_endpoint: env_config
                .provider_endpoint
                .or(file_config.provider_endpoint)
                .unwrap_or_else(default_provider_endpoint),
            request_timeout_secs: env_config
                .request_timeout_secs
                .or(file_config.request_timeout_secs)
                .unwrap_or_else(default_request_timeout_secs),
            log_dir: env_config
                .log_dir
                .or(file_config.log_dir)
                .unwrap_or_else(default_log_dir),
            audit_log_path: env_config
                .audit_log_path
                .or(file_config.audit_log_path)
                .unwrap_or_else(default_audit_log_path),
        };

        Ok(final_config)
    }
}
