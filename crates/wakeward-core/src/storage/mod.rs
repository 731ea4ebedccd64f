mod config;
pub mod database;

pub use config::{EngineConfig, EscalationDefaults, SnoozeAnchor};
pub use database::Database;

use std::path::PathBuf;

use crate::error::StoreError;

/// Durable key-value persistence port.
///
/// Every operation is atomic for a single key: a reader never observes a
/// partially written value. Both the Alarm Store and the Heartbeat Ledger
/// sit on top of this.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All `(key, value)` pairs whose key starts with `prefix`, ordered by key.
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
}

/// Returns `~/.config/wakeward[-dev]/` based on WAKEWARD_ENV.
///
/// Set WAKEWARD_ENV=dev to use development data directory.
///
/// # Errors
/// Returns an error if creating the config directory fails.
pub fn data_dir() -> Result<PathBuf, StoreError> {
    let base_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config");

    let env = std::env::var("WAKEWARD_ENV").unwrap_or_else(|_| "production".to_string());

    let dir = if env == "dev" {
        base_dir.join("wakeward-dev")
    } else {
        base_dir.join("wakeward")
    };

    std::fs::create_dir_all(&dir).map_err(|e| StoreError::DataDir(e.to_string()))?;
    Ok(dir)
}
