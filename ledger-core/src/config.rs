//! Configuration management
//!
//! Settings live in `settings.json` inside the ledger directory:
//! ```json
//! {
//!   "ledger": {
//!     "databaseFile": "ledger.duckdb",
//!     "allowNegativeBalance": true,
//!     "lockTimeoutMs": 5000,
//!     "maxCommitAttempts": 5
//!   }
//! }
//! ```
//! Keys this crate does not know about are kept when the file is saved.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapters::duckdb::StoreOptions;
use crate::services::LedgerPolicy;

const SETTINGS_FILE: &str = "settings.json";

/// Upper bound for `maxCommitAttempts`
pub const MAX_COMMIT_ATTEMPTS: u32 = 50;

fn clamp_attempts(attempts: u32) -> u32 {
    let clamped = attempts.clamp(1, MAX_COMMIT_ATTEMPTS);
    if clamped != attempts {
        warn!(requested = attempts, used = clamped, "maxCommitAttempts out of range");
    }
    clamped
}

/// Raw settings.json structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsFile {
    #[serde(default)]
    ledger: LedgerSettings,
    #[serde(flatten)]
    other: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    database_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_negative_balance: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lock_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_commit_attempts: Option<u32>,
    #[serde(flatten)]
    other: HashMap<String, serde_json::Value>,
}

/// Ledger configuration (resolved view of settings + environment)
#[derive(Debug, Clone)]
pub struct Config {
    pub database_file: String,
    pub allow_negative_balance: bool,
    pub lock_timeout_ms: u64,
    pub max_commit_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        let policy = LedgerPolicy::default();
        Self {
            database_file: "ledger.duckdb".to_string(),
            allow_negative_balance: policy.allow_negative_balance,
            lock_timeout_ms: StoreOptions::default().lock_timeout.as_millis() as u64,
            max_commit_attempts: policy.max_commit_attempts,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "true" | "1" | "yes" | "TRUE" | "YES" => Some(true),
        "false" | "0" | "no" | "FALSE" | "NO" => Some(false),
        _ => None,
    }
}

fn read_settings(ledger_dir: &Path) -> Result<SettingsFile> {
    let settings_path = ledger_dir.join(SETTINGS_FILE);
    if !settings_path.exists() {
        return Ok(SettingsFile::default());
    }

    let content = std::fs::read_to_string(&settings_path)
        .with_context(|| format!("Failed to read {}", settings_path.display()))?;
    Ok(serde_json::from_str(&content).unwrap_or_else(|e| {
        warn!(error = %e, "settings.json is not valid, using defaults");
        SettingsFile::default()
    }))
}

impl Config {
    /// Load config from the ledger directory
    ///
    /// Environment overrides (for CI/testing):
    /// - `LEDGER_ALLOW_NEGATIVE` (true/false/1/0/yes/no)
    /// - `LEDGER_LOCK_TIMEOUT_MS`
    pub fn load(ledger_dir: &Path) -> Result<Self> {
        let mut config = Self::load_settings(ledger_dir)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load only what settings.json says, ignoring the environment
    pub fn load_settings(ledger_dir: &Path) -> Result<Self> {
        Ok(Self::from_settings(&read_settings(ledger_dir)?))
    }

    /// Set the commit attempt budget, kept within 1..=[`MAX_COMMIT_ATTEMPTS`]
    pub fn set_max_commit_attempts(&mut self, attempts: u32) {
        self.max_commit_attempts = clamp_attempts(attempts);
    }

    fn from_settings(raw: &SettingsFile) -> Self {
        let defaults = Self::default();
        let ledger = &raw.ledger;
        Self {
            database_file: ledger
                .database_file
                .clone()
                .unwrap_or(defaults.database_file),
            allow_negative_balance: ledger
                .allow_negative_balance
                .unwrap_or(defaults.allow_negative_balance),
            lock_timeout_ms: ledger.lock_timeout_ms.unwrap_or(defaults.lock_timeout_ms),
            max_commit_attempts: ledger
                .max_commit_attempts
                .map(clamp_attempts)
                .unwrap_or(defaults.max_commit_attempts),
        }
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(value) = var("LEDGER_ALLOW_NEGATIVE") {
            match parse_flag(&value) {
                Some(flag) => self.allow_negative_balance = flag,
                None => warn!(value = %value, "ignoring LEDGER_ALLOW_NEGATIVE"),
            }
        }
        if let Some(value) = var("LEDGER_LOCK_TIMEOUT_MS") {
            match value.parse() {
                Ok(ms) => self.lock_timeout_ms = ms,
                Err(_) => warn!(value = %value, "ignoring LEDGER_LOCK_TIMEOUT_MS"),
            }
        }
    }

    /// Save config to the ledger directory
    /// Preserves other settings that the ledger doesn't manage
    pub fn save(&self, ledger_dir: &Path) -> Result<()> {
        let settings_path = ledger_dir.join(SETTINGS_FILE);
        let mut settings = read_settings(ledger_dir)?;

        settings.ledger.database_file = Some(self.database_file.clone());
        settings.ledger.allow_negative_balance = Some(self.allow_negative_balance);
        settings.ledger.lock_timeout_ms = Some(self.lock_timeout_ms);
        settings.ledger.max_commit_attempts = Some(self.max_commit_attempts);

        let content = serde_json::to_string_pretty(&settings)?;
        std::fs::write(&settings_path, content)
            .with_context(|| format!("Failed to write {}", settings_path.display()))?;
        Ok(())
    }

    pub fn policy(&self) -> LedgerPolicy {
        LedgerPolicy {
            allow_negative_balance: self.allow_negative_balance,
            max_commit_attempts: self.max_commit_attempts,
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
        }
    }
}
