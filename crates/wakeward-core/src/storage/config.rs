//! TOML-based engine configuration.
//!
//! Stores the timing contracts and defaults the engine runs with:
//! - Heartbeat interval and stale threshold used by reconciliation
//! - Escalation defaults applied when an alarm does not override them
//! - Snooze anchoring and ring timeout
//! - Scheduling offset and backup wake delay
//!
//! Configuration is stored at `~/.config/wakeward/config.toml`.

use chrono::{Duration, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::data_dir;
use crate::alarm::MAX_STEP_INTERVAL_SECS;
use crate::error::ConfigError;

/// Where a snooze re-fire is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnoozeAnchor {
    /// `session fire instant + delay`; repeated snoozes do not drift.
    FireTime,
    /// `now + delay`.
    Now,
}

/// Escalation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationDefaults {
    #[serde(default = "default_base_volume")]
    pub base_volume: f64,
    #[serde(default = "default_max_volume")]
    pub max_volume: f64,
    #[serde(default = "default_step_amount")]
    pub step_amount: f64,
    #[serde(default = "default_step_interval_secs")]
    pub step_interval_secs: u64,
}

/// Engine configuration.
///
/// Serialized to/from TOML at `~/.config/wakeward/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Heartbeat age beyond which a ringing session is presumed killed.
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
    /// Elapsed time outside `[0, max_clock_drift_hours]` is logged as tampering.
    #[serde(default = "default_max_clock_drift_hours")]
    pub max_clock_drift_hours: u64,
    #[serde(default = "default_snooze_anchor")]
    pub snooze_anchor: SnoozeAnchor,
    #[serde(default = "default_snooze_minutes")]
    pub default_snooze_minutes: u32,
    /// Unacknowledged sessions are auto-snoozed after this long. 0 disables.
    #[serde(default = "default_ring_timeout_secs")]
    pub ring_timeout_secs: u64,
    /// Delay of the fallback OS wake after the primary one. 0 disables.
    #[serde(default = "default_backup_offset_secs")]
    pub backup_offset_secs: u64,
    /// Offset used to evaluate wall-clock alarm times.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,
    #[serde(default)]
    pub escalation: EscalationDefaults,
}

// Default functions
fn default_base_volume() -> f64 {
    0.5
}
fn default_max_volume() -> f64 {
    1.0
}
fn default_step_amount() -> f64 {
    0.1
}
fn default_step_interval_secs() -> u64 {
    10
}
fn default_heartbeat_interval_secs() -> u64 {
    10
}
fn default_stale_threshold_secs() -> u64 {
    30
}
fn default_max_clock_drift_hours() -> u64 {
    24
}
fn default_snooze_anchor() -> SnoozeAnchor {
    SnoozeAnchor::FireTime
}
fn default_snooze_minutes() -> u32 {
    5
}
fn default_ring_timeout_secs() -> u64 {
    600
}
fn default_backup_offset_secs() -> u64 {
    60
}
fn default_max_channels() -> usize {
    4
}

impl Default for EscalationDefaults {
    fn default() -> Self {
        Self {
            base_volume: default_base_volume(),
            max_volume: default_max_volume(),
            step_amount: default_step_amount(),
            step_interval_secs: default_step_interval_secs(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_threshold_secs: default_stale_threshold_secs(),
            max_clock_drift_hours: default_max_clock_drift_hours(),
            snooze_anchor: default_snooze_anchor(),
            default_snooze_minutes: default_snooze_minutes(),
            ring_timeout_secs: default_ring_timeout_secs(),
            backup_offset_secs: default_backup_offset_secs(),
            utc_offset_minutes: 0,
            max_channels: default_max_channels(),
            escalation: EscalationDefaults::default(),
        }
    }
}

impl EngineConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::seconds(self.heartbeat_interval_secs as i64)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::seconds(self.stale_threshold_secs as i64)
    }

    pub fn max_clock_drift(&self) -> Duration {
        Duration::hours(self.max_clock_drift_hours as i64)
    }

    pub fn ring_timeout(&self) -> Option<Duration> {
        (self.ring_timeout_secs > 0).then(|| Duration::seconds(self.ring_timeout_secs as i64))
    }

    pub fn backup_offset(&self) -> Option<Duration> {
        (self.backup_offset_secs > 0).then(|| Duration::seconds(self.backup_offset_secs as i64))
    }

    /// Offset for wall-clock alarm times; out-of-range values fall back to UTC.
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix())
    }

    /// Check the timing invariants the reconciliation logic relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat_interval_secs".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.stale_threshold_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue {
                key: "stale_threshold_secs".into(),
                message: format!(
                    "must exceed heartbeat_interval_secs ({})",
                    self.heartbeat_interval_secs
                ),
            });
        }
        let esc = &self.escalation;
        if !(0.0..=1.0).contains(&esc.base_volume) || !(0.0..=1.0).contains(&esc.max_volume) {
            return Err(ConfigError::InvalidValue {
                key: "escalation".into(),
                message: "volumes must be within 0.0..=1.0".into(),
            });
        }
        if esc.base_volume > esc.max_volume {
            return Err(ConfigError::InvalidValue {
                key: "escalation.base_volume".into(),
                message: "must not exceed max_volume".into(),
            });
        }
        if !(1..=MAX_STEP_INTERVAL_SECS).contains(&esc.step_interval_secs) {
            return Err(ConfigError::InvalidValue {
                key: "escalation.step_interval_secs".into(),
                message: format!("must be within 1..={MAX_STEP_INTERVAL_SECS}"),
            });
        }
        if !esc.step_amount.is_finite() || esc.step_amount < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "escalation.step_amount".into(),
                message: "must be a finite, non-negative number".into(),
            });
        }
        if FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60)).is_none() {
            return Err(ConfigError::InvalidValue {
                key: "utc_offset_minutes".into(),
                message: "must be within +/- 24h".into(),
            });
        }
        Ok(())
    }

    fn get_json_value_by_path<'a>(
        root: &'a serde_json::Value,
        key: &str,
    ) -> Option<&'a serde_json::Value> {
        if key.is_empty() {
            return None;
        }

        let mut current = root;
        for part in key.split('.') {
            current = current.get(part)?;
        }
        Some(current)
    }

    fn set_json_value_by_path(
        root: &mut serde_json::Value,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        };

        let mut parts = key.split('.').peekable();
        let mut current = root;
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                let obj = current
                    .as_object_mut()
                    .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
                let existing = obj
                    .get(part)
                    .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;

                let new_value = match existing {
                    serde_json::Value::Bool(_) => serde_json::Value::Bool(
                        value.parse::<bool>().map_err(|e| invalid(e.to_string()))?,
                    ),
                    serde_json::Value::Number(_) => {
                        if let Ok(n) = value.parse::<i64>() {
                            serde_json::Value::Number(n.into())
                        } else {
                            let n = value
                                .parse::<f64>()
                                .map_err(|_| invalid(format!("cannot parse '{value}' as number")))?;
                            serde_json::Number::from_f64(n)
                                .map(serde_json::Value::Number)
                                .ok_or_else(|| invalid(format!("cannot parse '{value}' as number")))?
                        }
                    }
                    _ => serde_json::Value::String(value.into()),
                };

                obj.insert(part.to_string(), new_value);
                return Ok(());
            }

            current = current
                .get_mut(part)
                .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        }

        Err(ConfigError::UnknownKey(key.to_string()))
    }

    pub fn path() -> Result<PathBuf, ConfigError> {
        let dir = data_dir().map_err(|e| ConfigError::LoadFailed {
            path: PathBuf::from("config.toml"),
            message: e.to_string(),
        })?;
        Ok(dir.join("config.toml"))
    }

    /// Load from disk or return (and write) the default.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation, or if the default config cannot be written.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path()?;
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let cfg: EngineConfig =
                    toml::from_str(&content).map_err(|e| ConfigError::LoadFailed {
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
                cfg.validate()?;
                Ok(cfg)
            }
            Err(_) => {
                let cfg = Self::default();
                cfg.save()?;
                Ok(cfg)
            }
        }
    }

    /// Persist to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::path()?;
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::SaveFailed {
            path: path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&path, content).map_err(|e| ConfigError::SaveFailed {
            path,
            message: e.to_string(),
        })
    }

    /// Get a config value as string by dot-separated key.
    pub fn get(&self, key: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let val = Self::get_json_value_by_path(&json, key)?;
        match val {
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Set a config value by dot-separated key. The result must still validate.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut json = serde_json::to_value(&*self).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Self::set_json_value_by_path(&mut json, key, value)?;
        let updated: EngineConfig =
            serde_json::from_value(json).map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}
