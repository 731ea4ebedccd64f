//! Ringing session model.
//!
//! A [`Session`] is one ringing episode of an alarm. It only exists from
//! `Ringing` onward; the scheduled-but-not-fired phase is owned by the
//! scheduler's timer handles.
//!
//! ## State Transitions
//!
//! ```text
//! Ringing -> ProofPending -> Dismissed
//! Ringing -> Dismissed                       (no proof required)
//! Ringing | ProofPending -> Snoozed -> PunishmentDispatched
//! Ringing | ProofPending -> Interrupted -> PunishmentDispatched
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Identifier of a single firing of an alarm.
///
/// Derived from the alarm id and the fire instant, so a duplicate OS
/// delivery of the same firing maps onto the same id while every new
/// firing (including snooze re-fires) gets a distinct one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn derive(alarm_id: &str, fire_at: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(alarm_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(fire_at.timestamp_millis().to_be_bytes());
        let digest = hasher.finalize();
        Self(format!("sess-{}", hex::encode(&digest[..16])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Ringing,
    ProofPending,
    Dismissed,
    Snoozed,
    Interrupted,
    PunishmentDispatched,
}

impl SessionStatus {
    /// Ringing or waiting on proof: the ledger must keep heartbeating.
    pub fn is_live(self) -> bool {
        matches!(self, SessionStatus::Ringing | SessionStatus::ProofPending)
    }

    /// Dismissed or PunishmentDispatched.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Dismissed | SessionStatus::PunishmentDispatched
        )
    }
}

/// In-memory representation of one ringing episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub alarm_id: String,
    pub label: String,
    pub status: SessionStatus,
    /// Instant the alarm was scheduled to fire.
    pub fire_at: DateTime<Utc>,
    /// Instant the session actually started ringing.
    pub started_at: DateTime<Utc>,
    pub volume: f64,
    /// Snoozes taken by earlier sessions in this chain.
    pub snooze_count: u32,
}

impl Session {
    pub fn new(
        alarm_id: &str,
        label: &str,
        fire_at: DateTime<Utc>,
        started_at: DateTime<Utc>,
        snooze_count: u32,
    ) -> Self {
        Self {
            id: SessionId::derive(alarm_id, fire_at),
            alarm_id: alarm_id.to_string(),
            label: label.to_string(),
            status: SessionStatus::Ringing,
            fire_at,
            started_at,
            volume: 0.0,
            snooze_count,
        }
    }

    /// Ringing -> ProofPending.
    pub fn require_proof(&mut self) -> Result<(), CoreError> {
        self.transition(SessionStatus::ProofPending, "request proof", |from| {
            from == SessionStatus::Ringing
        })
    }

    /// Ringing (no proof) or ProofPending (proof verified) -> Dismissed.
    pub fn dismiss(&mut self) -> Result<(), CoreError> {
        self.transition(SessionStatus::Dismissed, "dismiss", SessionStatus::is_live)
    }

    /// Ringing | ProofPending -> Snoozed.
    pub fn snooze(&mut self) -> Result<(), CoreError> {
        self.transition(SessionStatus::Snoozed, "snooze", SessionStatus::is_live)
    }

    /// Ringing | ProofPending -> Interrupted.
    pub fn interrupt(&mut self) -> Result<(), CoreError> {
        self.transition(SessionStatus::Interrupted, "interrupt", SessionStatus::is_live)
    }

    /// Snoozed | Interrupted -> PunishmentDispatched.
    pub fn mark_punished(&mut self) -> Result<(), CoreError> {
        self.transition(
            SessionStatus::PunishmentDispatched,
            "dispatch punishment",
            |from| matches!(from, SessionStatus::Snoozed | SessionStatus::Interrupted),
        )
    }

    fn transition(
        &mut self,
        to: SessionStatus,
        action: &'static str,
        allowed: impl Fn(SessionStatus) -> bool,
    ) -> Result<(), CoreError> {
        if !allowed(self.status) {
            return Err(CoreError::InvalidTransition {
                from: self.status,
                action,
            });
        }
        self.status = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
    }

    #[test]
    fn session_id_is_deterministic_per_firing() {
        let a = SessionId::derive("alarm-1", at(6, 0, 0));
        let b = SessionId::derive("alarm-1", at(6, 0, 0));
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("sess-"));
        assert_eq!(a.as_str().len(), "sess-".len() + 32);
    }

    #[test]
    fn session_id_differs_across_firings_and_alarms() {
        let base = SessionId::derive("alarm-1", at(6, 0, 0));
        assert_ne!(base, SessionId::derive("alarm-1", at(6, 0, 0) + Duration::minutes(5)));
        assert_ne!(base, SessionId::derive("alarm-2", at(6, 0, 0)));
    }

    #[test]
    fn proof_path_reaches_dismissed() {
        let mut s = Session::new("a", "Wake", at(6, 0, 0), at(6, 0, 0), 0);
        assert_eq!(s.status, SessionStatus::Ringing);
        s.require_proof().unwrap();
        assert_eq!(s.status, SessionStatus::ProofPending);
        s.dismiss().unwrap();
        assert!(s.status.is_terminal());
    }

    #[test]
    fn snooze_then_punish() {
        let mut s = Session::new("a", "Wake", at(6, 0, 0), at(6, 0, 0), 0);
        s.snooze().unwrap();
        assert!(!s.status.is_live());
        s.mark_punished().unwrap();
        assert_eq!(s.status, SessionStatus::PunishmentDispatched);
    }

    #[test]
    fn terminal_sessions_reject_further_transitions() {
        let mut s = Session::new("a", "Wake", at(6, 0, 0), at(6, 0, 0), 0);
        s.dismiss().unwrap();
        assert!(matches!(
            s.snooze(),
            Err(CoreError::InvalidTransition {
                from: SessionStatus::Dismissed,
                ..
            })
        ));
        assert!(s.mark_punished().is_err());
        assert!(s.require_proof().is_err());
    }

    #[test]
    fn cannot_punish_a_ringing_session() {
        let mut s = Session::new("a", "Wake", at(6, 0, 0), at(6, 0, 0), 0);
        assert!(s.mark_punished().is_err());
        s.interrupt().unwrap();
        assert!(s.mark_punished().is_ok());
    }
}
