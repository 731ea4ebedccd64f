//! OS wake delivery port.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;
use crate::session::SessionId;

/// Opaque handle returned by the platform for a scheduled wake.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WakeToken(String);

impl WakeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WakeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    Primary,
    Snooze,
    /// Fallback trigger for the same firing; carries the primary's session id.
    Backup,
}

/// Data handed to the platform so the wake callback can be routed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WakePayload {
    pub alarm_id: String,
    pub label: String,
    pub kind: TimerKind,
    /// Scheduled instant of the firing; a backup wake carries the primary's.
    pub fire_at: DateTime<Utc>,
    #[serde(default)]
    pub snooze_count: u32,
}

/// Platform alarm manager (exact alarms, notification triggers).
///
/// Implementations must fire `fire_at` even when the app is suspended, and
/// call back into the engine with the session id they were scheduled with.
pub trait WakeDelivery: Send + Sync {
    fn schedule_wake(
        &self,
        session_id: &SessionId,
        fire_at: DateTime<Utc>,
        payload: &WakePayload,
    ) -> Result<WakeToken, DeliveryError>;

    fn cancel_wake(&self, token: &WakeToken) -> Result<(), DeliveryError>;
}

/// One wake currently held by [`MemoryDelivery`].
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWake {
    pub token: WakeToken,
    pub session_id: SessionId,
    pub fire_at: DateTime<Utc>,
    pub payload: WakePayload,
}

/// In-process delivery that only records what was scheduled.
///
/// Used by the CLI, which has no OS trigger to hand wakes to, and by tests.
#[derive(Debug, Default)]
pub struct MemoryDelivery {
    inner: Mutex<MemoryDeliveryState>,
}

#[derive(Debug, Default)]
struct MemoryDeliveryState {
    next: u64,
    pending: Vec<PendingWake>,
    fail_schedule: bool,
}

impl MemoryDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Vec<PendingWake> {
        self.inner
            .lock()
            .map(|state| state.pending.clone())
            .unwrap_or_default()
    }

    /// Make subsequent `schedule_wake` calls fail.
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut state) = self.inner.lock() {
            state.fail_schedule = failing;
        }
    }
}

impl WakeDelivery for MemoryDelivery {
    fn schedule_wake(
        &self,
        session_id: &SessionId,
        fire_at: DateTime<Utc>,
        payload: &WakePayload,
    ) -> Result<WakeToken, DeliveryError> {
        let mut state = self.inner.lock().map_err(|_| DeliveryError::ScheduleFailed {
            session_id: session_id.clone(),
            fire_at,
            message: "delivery lock poisoned".into(),
        })?;
        if state.fail_schedule {
            return Err(DeliveryError::ScheduleFailed {
                session_id: session_id.clone(),
                fire_at,
                message: "delivery unavailable".into(),
            });
        }
        state.next += 1;
        let token = WakeToken::new(format!("wake-{}", state.next));
        state.pending.push(PendingWake {
            token: token.clone(),
            session_id: session_id.clone(),
            fire_at,
            payload: payload.clone(),
        });
        Ok(token)
    }

    fn cancel_wake(&self, token: &WakeToken) -> Result<(), DeliveryError> {
        let mut state = self.inner.lock().map_err(|_| DeliveryError::CancelFailed {
            token: token.to_string(),
            message: "delivery lock poisoned".into(),
        })?;
        state.pending.retain(|wake| wake.token != *token);
        Ok(())
    }
}
