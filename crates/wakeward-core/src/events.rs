use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::heartbeat::Anomaly;
use crate::punishment::{ChannelKind, PunishmentReason};
use crate::scheduler::TimerKind;
use crate::session::{SessionId, SessionStatus};

/// Every state change in the engine produces an Event.
/// The host UI renders them; the runtime forwards them on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    AlarmArmed {
        alarm_id: String,
        session_id: SessionId,
        fire_at: DateTime<Utc>,
        kind: TimerKind,
    },
    AlarmDisarmed {
        alarm_id: String,
        at: DateTime<Utc>,
    },
    /// A wake arrived and a new session started ringing.
    AlarmFired {
        alarm_id: String,
        session_id: SessionId,
        label: String,
        fire_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    /// A wake for a session that is ringing or already handled.
    DuplicateWakeIgnored {
        session_id: SessionId,
        at: DateTime<Utc>,
    },
    /// A wake that matches no pending firing or enabled alarm.
    WakeIgnored {
        session_id: SessionId,
        reason: String,
        at: DateTime<Utc>,
    },
    /// Another alarm fired while a session was active.
    FireQueued {
        alarm_id: String,
        session_id: SessionId,
        at: DateTime<Utc>,
    },
    VolumeStepped {
        session_id: SessionId,
        step: u32,
        volume: f64,
        at: DateTime<Utc>,
    },
    EscalationCompleted {
        session_id: SessionId,
        volume: f64,
        at: DateTime<Utc>,
    },
    ProofRequested {
        session_id: SessionId,
        requirement: String,
        at: DateTime<Utc>,
    },
    ProofRejected {
        session_id: SessionId,
        reason: String,
        at: DateTime<Utc>,
    },
    SessionDismissed {
        session_id: SessionId,
        alarm_id: String,
        at: DateTime<Utc>,
    },
    SessionSnoozed {
        session_id: SessionId,
        alarm_id: String,
        /// Fire instant of the re-armed session, if re-arming succeeded.
        next_fire_at: Option<DateTime<Utc>>,
        next_session_id: Option<SessionId>,
        auto: bool,
        at: DateTime<Utc>,
    },
    PunishmentDispatched {
        session_id: SessionId,
        reason: PunishmentReason,
        triggered: Vec<ChannelKind>,
        failed: Vec<ChannelKind>,
        already_dispatched: bool,
        at: DateTime<Utc>,
    },
    /// Startup reconciliation finished.
    Reconciled {
        outcome: String,
        session_id: Option<SessionId>,
        at: DateTime<Utc>,
    },
    AnomalyDetected {
        anomaly: Anomaly,
        at: DateTime<Utc>,
    },
    /// A still-active session from before a restart was picked up again.
    SessionResumed {
        session_id: SessionId,
        status: SessionStatus,
        at: DateTime<Utc>,
    },
    HeartbeatFailed {
        session_id: SessionId,
        error: String,
        at: DateTime<Utc>,
    },
    RearmFailed {
        alarm_id: String,
        error: String,
        at: DateTime<Utc>,
    },
}

impl Event {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Event::AlarmArmed { fire_at, .. } => *fire_at,
            Event::AlarmDisarmed { at, .. }
            | Event::AlarmFired { at, .. }
            | Event::DuplicateWakeIgnored { at, .. }
            | Event::WakeIgnored { at, .. }
            | Event::FireQueued { at, .. }
            | Event::VolumeStepped { at, .. }
            | Event::EscalationCompleted { at, .. }
            | Event::ProofRequested { at, .. }
            | Event::ProofRejected { at, .. }
            | Event::SessionDismissed { at, .. }
            | Event::SessionSnoozed { at, .. }
            | Event::PunishmentDispatched { at, .. }
            | Event::Reconciled { at, .. }
            | Event::AnomalyDetected { at, .. }
            | Event::SessionResumed { at, .. }
            | Event::HeartbeatFailed { at, .. }
            | Event::RearmFailed { at, .. } => *at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn events_are_tagged_by_type() {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).unwrap();
        let event = Event::SessionDismissed {
            session_id: SessionId::from("sess-1"),
            alarm_id: "a".into(),
            at,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "SessionDismissed");
        assert_eq!(json["session_id"], "sess-1");
        assert_eq!(event.at(), at);
    }
}
