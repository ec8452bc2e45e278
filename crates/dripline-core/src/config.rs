//! Dripline configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{DriplineError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DriplineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

impl DriplineConfig {
    /// Load config from the default path (~/.dripline/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DriplineError::Config(format!("Failed to read config: {e}")))?;
        Self::parse(&content)
    }

    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| DriplineError::Config(format!("Failed to parse config: {e}")))
    }

    /// Save config to a path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| DriplineError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Dripline home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dripline")
    }
}

/// SQLite database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.dripline/dripline.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Dispatch loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Seconds between poll ticks.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Maximum steps selected by one pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Minutes after which a `PROCESSING` step is considered abandoned. 0 disables recovery.
    #[serde(default = "default_stale_claim_minutes")]
    pub stale_claim_minutes: u64,
    /// Restrict the poll loop to these accounts. Empty means every account.
    #[serde(default)]
    pub accounts: Vec<String>,
    /// Accounts dispatched in parallel by one poll tick.
    #[serde(default = "default_max_concurrent_accounts")]
    pub max_concurrent_accounts: usize,
}

fn default_interval_secs() -> u64 { 60 }
fn default_batch_size() -> usize { 100 }
fn default_stale_claim_minutes() -> u64 { 15 }
fn default_max_concurrent_accounts() -> usize { 4 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            stale_claim_minutes: default_stale_claim_minutes(),
            accounts: Vec::new(),
            max_concurrent_accounts: default_max_concurrent_accounts(),
        }
    }
}

/// Outbound delivery provider selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// "log", "smtp" or "webhook".
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Provider tried when the primary one fails.
    #[serde(default)]
    pub fallback: Option<String>,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    /// Consecutive transport failures before a failover link is benched.
    #[serde(default = "default_failover_max_failures")]
    pub failover_max_failures: u32,
    /// Seconds a benched failover link is skipped.
    #[serde(default = "default_failover_cooldown_secs")]
    pub failover_cooldown_secs: u64,
}

fn default_provider() -> String { "log".into() }
fn default_failover_max_failures() -> u32 { 3 }
fn default_failover_cooldown_secs() -> u64 { 60 }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            fallback: None,
            smtp: None,
            webhook: None,
            failover_max_failures: default_failover_max_failures(),
            failover_cooldown_secs: default_failover_cooldown_secs(),
        }
    }
}

/// SMTP relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub from_email: String,
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_smtp_port() -> u16 { 587 }
fn default_timeout_secs() -> u64 { 10 }

/// Generic HTTP webhook settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}
