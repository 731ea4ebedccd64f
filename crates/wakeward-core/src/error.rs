//! Core error types for wakeward-core.
//!
//! The taxonomy mirrors how failures are handled by the engine: delivery
//! errors are retried by the caller, persistence errors in the heartbeat
//! path are logged and retried on the next tick, verification errors keep
//! the session in `ProofPending`, and dispatch errors are recorded per
//! channel. None of them are allowed to crash the host process.

use std::path::PathBuf;
use thiserror::Error;

use crate::session::{SessionId, SessionStatus};

/// Core error type for wakeward-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// OS wake scheduling or cancellation failed.
    #[error("Wake delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    /// Durable store read/write failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Proof check failed or errored.
    #[error("Proof verification error: {0}")]
    Verification(String),

    /// Punishment dispatch could not run at all (per-channel failures are
    /// reported in the dispatch result instead).
    #[error("Dispatch error for session {session_id}: {message}")]
    Dispatch {
        session_id: SessionId,
        message: String,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Operation not allowed in the current session status.
    #[error("Cannot {action} while session is {from:?}")]
    InvalidTransition {
        from: SessionStatus,
        action: &'static str,
    },

    /// Startup reconciliation has not run yet in this process.
    #[error("Startup reconciliation must complete before alarms can be armed")]
    NotReconciled,

    /// No session is currently ringing.
    #[error("No active session")]
    NoActiveSession,

    /// Alarm id not present in the store.
    #[error("Unknown alarm: {0}")]
    UnknownAlarm(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the OS wake delivery port.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Failed to schedule wake for {session_id} at {fire_at}: {message}")]
    ScheduleFailed {
        session_id: SessionId,
        fire_at: chrono::DateTime<chrono::Utc>,
        message: String,
    },

    #[error("Failed to cancel wake token {token}: {message}")]
    CancelFailed { token: String, message: String },
}

/// Durable key-value store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to open database connection
    #[error("Failed to open store at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Query execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Database is locked
    #[error("Store is locked")]
    Locked,

    /// The connection mutex was poisoned by a panicking writer.
    #[error("Store connection lock poisoned")]
    Poisoned,

    /// Stored value could not be decoded.
    #[error("Corrupt value under key '{key}': {message}")]
    Corrupt { key: String, message: String },

    #[error("Failed to access data directory: {0}")]
    DataDir(String),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Unknown dot-path key
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),
}

/// Validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Punishment config enables more channels than allowed.
    #[error("At most {max} punishment channels may be enabled, got {got}")]
    TooManyChannels { max: usize, got: usize },

    /// One-shot fire time is not in the future.
    #[error("Fire time {at} is not after {now}")]
    FireTimeInPast {
        at: chrono::DateTime<chrono::Utc>,
        now: chrono::DateTime<chrono::Utc>,
    },

    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _msg) => {
                if e.code == rusqlite::ErrorCode::DatabaseLocked
                    || e.code == rusqlite::ErrorCode::DatabaseBusy
                {
                    StoreError::Locked
                } else {
                    StoreError::QueryFailed(err.to_string())
                }
            }
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;
