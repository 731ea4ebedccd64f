//! Alarm scheduler.
//!
//! Turns alarm schedules into OS wake requests and keeps one
//! [`TimerHandle`] per pending firing:
//! - Computes the next fire instant from the recurrence rule
//! - Schedules the primary wake and an optional backup wake for the same session
//! - Re-arms snoozes as one-shot handles without touching the recurrence
//! - Cancels outstanding wakes on disarm
//!
//! The scheduler never reads or writes the alarm store; the engine decides
//! whether a fired alarm is re-armed or disabled.

mod delivery;

pub use delivery::{MemoryDelivery, PendingWake, TimerKind, WakeDelivery, WakePayload, WakeToken};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::{Deserialize, Serialize};

use crate::alarm::{AlarmSchedule, FireTime};
use crate::error::{CoreError, DeliveryError, ValidationError};
use crate::heartbeat::HeartbeatLedger;
use crate::session::SessionId;
use crate::storage::SnoozeAnchor;

/// A pending firing that has been handed to the OS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerHandle {
    pub alarm_id: String,
    pub session_id: SessionId,
    pub label: String,
    pub fire_at: DateTime<Utc>,
    pub kind: TimerKind,
    pub token: WakeToken,
    pub backup: Option<WakeToken>,
    pub snooze_count: u32,
    pub backup_wake: bool,
}

impl TimerHandle {
    /// Rebuild a handle from a wake payload whose handle was lost, e.g. a
    /// wake delivered to a freshly started process.
    pub fn from_payload(session_id: &SessionId, payload: &WakePayload) -> Self {
        Self {
            alarm_id: payload.alarm_id.clone(),
            session_id: session_id.clone(),
            label: payload.label.clone(),
            fire_at: payload.fire_at,
            kind: match payload.kind {
                TimerKind::Backup => TimerKind::Primary,
                kind => kind,
            },
            token: WakeToken::new(""),
            backup: None,
            snooze_count: payload.snooze_count,
            backup_wake: false,
        }
    }

    fn payload(&self, kind: TimerKind) -> WakePayload {
        WakePayload {
            alarm_id: self.alarm_id.clone(),
            label: self.label.clone(),
            kind,
            fire_at: self.fire_at,
            snooze_count: self.snooze_count,
        }
    }
}

/// Scheduling settings taken from the engine configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub utc_offset: FixedOffset,
    /// `None` disables backup wakes globally.
    pub backup_offset: Option<Duration>,
    pub snooze_anchor: SnoozeAnchor,
}

pub struct Scheduler {
    delivery: Arc<dyn WakeDelivery>,
    ledger: Arc<HeartbeatLedger>,
    config: SchedulerConfig,
    handles: HashMap<SessionId, TimerHandle>,
    /// Most recently fired handle per alarm; anchors snoozes and filters
    /// late duplicate wakes.
    last_fired: HashMap<String, TimerHandle>,
}

impl Scheduler {
    pub fn new(
        delivery: Arc<dyn WakeDelivery>,
        ledger: Arc<HeartbeatLedger>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            delivery,
            ledger,
            config,
            handles: HashMap::new(),
            last_fired: HashMap::new(),
        }
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.config.utc_offset
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn handles(&self) -> impl Iterator<Item = &TimerHandle> {
        self.handles.values()
    }

    pub fn handle(&self, session_id: &SessionId) -> Option<&TimerHandle> {
        self.handles.get(session_id)
    }

    /// Pending handles of `alarm_id`, earliest first.
    pub fn handles_for_alarm(&self, alarm_id: &str) -> Vec<&TimerHandle> {
        let mut handles: Vec<_> = self
            .handles
            .values()
            .filter(|h| h.alarm_id == alarm_id)
            .collect();
        handles.sort_by_key(|h| h.fire_at);
        handles
    }

    /// Earliest pending firing across all alarms.
    pub fn next_fire(&self) -> Option<&TimerHandle> {
        self.handles.values().min_by_key(|h| h.fire_at)
    }

    /// Whether `session_id` already fired in this process.
    pub fn was_fired(&self, session_id: &SessionId) -> bool {
        self.last_fired
            .values()
            .any(|h| h.session_id == *session_id)
    }

    pub fn last_fired(&self, alarm_id: &str) -> Option<&TimerHandle> {
        self.last_fired.get(alarm_id)
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Arm the next occurrence of `schedule` strictly after `now`.
    ///
    /// Any primary handle already pending for the alarm is cancelled
    /// first. Pending snoozes are left alone.
    pub fn arm(&mut self, schedule: &AlarmSchedule, now: DateTime<Utc>) -> Result<TimerHandle, CoreError> {
        let fire_at = match schedule.next_fire_after(now, self.config.utc_offset) {
            Some(at) => at,
            None => {
                let at = match schedule.fire_time {
                    FireTime::At { at } => at,
                    FireTime::Daily { .. } => now,
                };
                return Err(ValidationError::FireTimeInPast { at, now }.into());
            }
        };

        let stale: Vec<SessionId> = self
            .handles
            .values()
            .filter(|h| h.alarm_id == schedule.id && h.kind == TimerKind::Primary)
            .map(|h| h.session_id.clone())
            .collect();
        for session_id in stale {
            self.cancel_handle(&session_id)?;
        }

        self.schedule(
            &schedule.id,
            &schedule.label,
            fire_at,
            TimerKind::Primary,
            0,
            schedule.escalation.backup_wake,
        )
    }

    /// Arm a one-shot snooze re-fire for the alarm that last fired.
    ///
    /// With [`SnoozeAnchor::FireTime`] the new instant is the fired
    /// session's fire time plus the delay, falling back to `now + delay`
    /// when that has already passed.
    pub fn rearm_snooze(
        &mut self,
        alarm_id: &str,
        delay_minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<TimerHandle, CoreError> {
        let fired = self
            .last_fired
            .get(alarm_id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownAlarm(alarm_id.to_string()))?;
        let delay = Duration::minutes(i64::from(delay_minutes.max(1)));

        let fire_at = match self.config.snooze_anchor {
            SnoozeAnchor::FireTime if fired.fire_at + delay > now => fired.fire_at + delay,
            _ => now + delay,
        };

        let pending: Vec<SessionId> = self
            .handles
            .values()
            .filter(|h| h.alarm_id == alarm_id && h.kind == TimerKind::Snooze)
            .map(|h| h.session_id.clone())
            .collect();
        for session_id in pending {
            self.cancel_handle(&session_id)?;
        }

        self.schedule(
            alarm_id,
            &fired.label,
            fire_at,
            TimerKind::Snooze,
            fired.snooze_count + 1,
            fired.backup_wake,
        )
    }

    /// Cancel every pending wake of `alarm_id` and drop its ledger record
    /// if it owns the current one. Handles whose cancel failed are kept so
    /// the call can be retried.
    pub fn disarm(&mut self, alarm_id: &str) -> Result<usize, CoreError> {
        let sessions: Vec<SessionId> = self
            .handles
            .values()
            .filter(|h| h.alarm_id == alarm_id)
            .map(|h| h.session_id.clone())
            .collect();

        let mut cancelled = 0;
        let mut first_error = None;
        for session_id in sessions {
            match self.cancel_handle(&session_id) {
                Ok(()) => cancelled += 1,
                Err(e) => {
                    tracing::warn!(alarm_id, session_id = %session_id, error = %e, "failed to cancel wake");
                    first_error.get_or_insert(e);
                }
            }
        }

        if self.ledger.clear_alarm(alarm_id)? {
            tracing::info!(alarm_id, "cleared heartbeat record of disarmed alarm");
        }
        self.last_fired.remove(alarm_id);

        match first_error {
            Some(e) => Err(e.into()),
            None => {
                tracing::debug!(alarm_id, cancelled, "alarm disarmed");
                Ok(cancelled)
            }
        }
    }

    /// Consume the handle of a firing session and cancel its backup wake.
    pub fn take_fired(&mut self, session_id: &SessionId) -> Option<TimerHandle> {
        let handle = self.handles.remove(session_id)?;
        if let Some(backup) = &handle.backup {
            if let Err(e) = self.delivery.cancel_wake(backup) {
                // The duplicate wake is filtered by session id when it arrives.
                tracing::warn!(session_id = %session_id, error = %e, "failed to cancel backup wake");
            }
        }
        self.record_fired(handle.clone());
        Some(handle)
    }

    /// Remember `handle` as the latest firing of its alarm.
    pub fn record_fired(&mut self, handle: TimerHandle) {
        self.last_fired.insert(handle.alarm_id.clone(), handle);
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn schedule(
        &mut self,
        alarm_id: &str,
        label: &str,
        fire_at: DateTime<Utc>,
        kind: TimerKind,
        snooze_count: u32,
        backup_wake: bool,
    ) -> Result<TimerHandle, CoreError> {
        let session_id = SessionId::derive(alarm_id, fire_at);
        if self.handles.contains_key(&session_id) {
            self.cancel_handle(&session_id)?;
        }

        let mut handle = TimerHandle {
            alarm_id: alarm_id.to_string(),
            session_id: session_id.clone(),
            label: label.to_string(),
            fire_at,
            kind,
            token: WakeToken::new(""),
            backup: None,
            snooze_count,
            backup_wake,
        };

        handle.token = self
            .delivery
            .schedule_wake(&session_id, fire_at, &handle.payload(kind))?;

        if let (true, Some(offset)) = (backup_wake, self.config.backup_offset) {
            match self.delivery.schedule_wake(
                &session_id,
                fire_at + offset,
                &handle.payload(TimerKind::Backup),
            ) {
                Ok(token) => handle.backup = Some(token),
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "backup wake not scheduled");
                }
            }
        }

        tracing::info!(
            alarm_id,
            session_id = %session_id,
            fire_at = %fire_at,
            kind = ?kind,
            "wake scheduled"
        );
        self.handles.insert(session_id, handle.clone());
        Ok(handle)
    }

    fn cancel_handle(&mut self, session_id: &SessionId) -> Result<(), DeliveryError> {
        let Some(handle) = self.handles.get(session_id) else {
            return Ok(());
        };
        self.delivery.cancel_wake(&handle.token)?;
        if let Some(backup) = &handle.backup {
            self.delivery.cancel_wake(backup)?;
        }
        self.handles.remove(session_id);
        Ok(())
    }
}
