//! Stepped volume escalation for a ringing session.
//!
//! Like the rest of the engine this is wall-clock driven and owns no
//! thread: the caller invokes `tick(now)` and gets back the volume steps
//! that became due. The level is computed from whole elapsed intervals
//! since `start`, so a late tick catches up and the sequence of levels is
//! non-decreasing by construction.
//!
//! ## State Transitions
//!
//! ```text
//! Idle -> Running -> (Completed | Stopped)
//! ```
//!
//! Escalation state is never persisted. A session resumed after a restart
//! starts again from the base volume.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionId;

/// Levels are rounded to micro-units so that `0.5 + 3 * 0.1` reads as `0.8`.
const LEVEL_SCALE: f64 = 1_000_000.0;

/// Sink for the playback volume (the audio path itself is the host's).
pub trait AudioOutput: Send + Sync {
    fn set_volume(&self, session_id: &SessionId, level: f64);
}

/// Audio sink that ignores volume changes.
pub struct NullAudio;

impl AudioOutput for NullAudio {
    fn set_volume(&self, _session_id: &SessionId, _level: f64) {}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationParams {
    pub base_volume: f64,
    pub max_volume: f64,
    pub step_amount: f64,
    pub step_interval: Duration,
}

impl Default for EscalationParams {
    fn default() -> Self {
        Self {
            base_volume: 0.5,
            max_volume: 1.0,
            step_amount: 0.1,
            step_interval: Duration::seconds(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EscalationState {
    Idle,
    Running,
    /// Max volume reached; no more steps.
    Completed,
    Stopped,
}

/// One volume change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeStep {
    pub session_id: SessionId,
    /// 0 is the base volume set on start.
    pub step: u32,
    pub volume: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct EscalationEngine {
    session_id: Option<SessionId>,
    params: EscalationParams,
    state: EscalationState,
    started_at: Option<DateTime<Utc>>,
    steps_taken: u32,
    volume: f64,
}

impl Default for EscalationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EscalationEngine {
    pub fn new() -> Self {
        Self {
            session_id: None,
            params: EscalationParams::default(),
            state: EscalationState::Idle,
            started_at: None,
            steps_taken: 0,
            volume: 0.0,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn state(&self) -> EscalationState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == EscalationState::Running
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn steps_taken(&self) -> u32 {
        self.steps_taken
    }

    /// When the next step is due, if escalation is still running.
    pub fn next_step_at(&self) -> Option<DateTime<Utc>> {
        if !self.is_running() {
            return None;
        }
        let started = self.started_at?;
        Some(started + self.params.step_interval * (self.steps_taken as i32 + 1))
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Bind to `session_id` and set the base volume. Restarting for a new
    /// session discards the previous one's progress.
    pub fn start(&mut self, session_id: &SessionId, params: EscalationParams, now: DateTime<Utc>) -> VolumeStep {
        let max_volume = params.max_volume.clamp(0.0, 1.0);
        let base = round_level(params.base_volume.clamp(0.0, max_volume));
        self.params = EscalationParams {
            max_volume,
            ..params
        };
        self.session_id = Some(session_id.clone());
        self.started_at = Some(now);
        self.steps_taken = 0;
        self.volume = base;
        self.state = if self.at_max(base) || self.params.step_amount <= 0.0 {
            EscalationState::Completed
        } else {
            EscalationState::Running
        };
        tracing::debug!(session_id = %session_id, volume = base, "escalation started");
        VolumeStep {
            session_id: session_id.clone(),
            step: 0,
            volume: base,
            at: now,
        }
    }

    /// Stop escalation for `session_id`. Safe to call repeatedly and for a
    /// session that is no longer the current one; returns whether anything
    /// was actually running.
    pub fn stop(&mut self, session_id: &SessionId) -> bool {
        if self.session_id.as_ref() != Some(session_id) {
            return false;
        }
        let was_running = self.is_running();
        if self.state != EscalationState::Idle {
            self.state = EscalationState::Stopped;
        }
        was_running
    }

    /// Emit every step that became due up to `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<VolumeStep> {
        let mut steps = Vec::new();
        if !self.is_running() {
            return steps;
        }
        let (Some(session_id), Some(started)) = (self.session_id.clone(), self.started_at) else {
            return steps;
        };

        let interval_ms = self.params.step_interval.num_milliseconds().max(1);
        let elapsed_ms = (now - started).num_milliseconds();
        if elapsed_ms < 0 {
            return steps;
        }
        let due = u32::try_from(elapsed_ms / interval_ms).unwrap_or(u32::MAX);

        while self.steps_taken < due {
            self.steps_taken += 1;
            let level = self.level_at(self.steps_taken);
            self.volume = level;
            steps.push(VolumeStep {
                session_id: session_id.clone(),
                step: self.steps_taken,
                volume: level,
                at: started + self.params.step_interval * self.steps_taken as i32,
            });
            if self.at_max(level) {
                self.state = EscalationState::Completed;
                tracing::debug!(session_id = %session_id, steps = self.steps_taken, "escalation reached max volume");
                break;
            }
        }
        steps
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn level_at(&self, step: u32) -> f64 {
        let raw = self.params.base_volume + self.params.step_amount * step as f64;
        round_level(raw.min(self.params.max_volume))
    }

    fn at_max(&self, level: f64) -> bool {
        level >= round_level(self.params.max_volume)
    }
}

fn round_level(level: f64) -> f64 {
    (level * LEVEL_SCALE).round() / LEVEL_SCALE
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap()
    }

    fn sid() -> SessionId {
        SessionId::from("sess-esc")
    }

    #[test]
    fn start_sets_base_volume() {
        let mut engine = EscalationEngine::new();
        let step = engine.start(&sid(), EscalationParams::default(), t0());
        assert_eq!(step.volume, 0.5);
        assert_eq!(step.step, 0);
        assert!(engine.is_running());
        assert_eq!(engine.next_step_at(), Some(t0() + Duration::seconds(10)));
    }

    #[test]
    fn steps_only_on_whole_intervals() {
        let mut engine = EscalationEngine::new();
        engine.start(&sid(), EscalationParams::default(), t0());
        assert!(engine.tick(t0() + Duration::seconds(9)).is_empty());
        let steps = engine.tick(t0() + Duration::seconds(10));
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].volume, 0.6);
    }

    #[test]
    fn reaches_max_after_fifty_seconds_and_stops() {
        let mut engine = EscalationEngine::new();
        engine.start(&sid(), EscalationParams::default(), t0());

        let mut volumes = Vec::new();
        for secs in (10..=50).step_by(10) {
            for step in engine.tick(t0() + Duration::seconds(secs)) {
                volumes.push(step.volume);
            }
        }

        assert_eq!(volumes, vec![0.6, 0.7, 0.8, 0.9, 1.0]);
        assert_eq!(engine.state(), EscalationState::Completed);
        assert!(engine.tick(t0() + Duration::seconds(120)).is_empty());
        assert_eq!(engine.volume(), 1.0);
    }

    #[test]
    fn late_tick_catches_up_and_clamps() {
        let mut engine = EscalationEngine::new();
        let params = EscalationParams {
            base_volume: 0.3,
            max_volume: 0.8,
            step_amount: 0.2,
            step_interval: Duration::seconds(5),
        };
        engine.start(&sid(), params, t0());
        let steps = engine.tick(t0() + Duration::minutes(5));
        let volumes: Vec<_> = steps.iter().map(|s| s.volume).collect();
        assert_eq!(volumes, vec![0.5, 0.7, 0.8]);
        assert_eq!(steps[2].at, t0() + Duration::seconds(15));
        assert_eq!(engine.state(), EscalationState::Completed);
    }

    #[test]
    fn stop_is_idempotent_and_scoped_to_session() {
        let mut engine = EscalationEngine::new();
        assert!(!engine.stop(&sid()));

        engine.start(&sid(), EscalationParams::default(), t0());
        assert!(!engine.stop(&SessionId::from("other")));
        assert!(engine.is_running());

        assert!(engine.stop(&sid()));
        assert!(!engine.stop(&sid()));
        assert_eq!(engine.state(), EscalationState::Stopped);
        assert!(engine.tick(t0() + Duration::seconds(30)).is_empty());
    }

    #[test]
    fn base_at_max_completes_immediately() {
        let mut engine = EscalationEngine::new();
        let params = EscalationParams {
            base_volume: 1.0,
            ..EscalationParams::default()
        };
        engine.start(&sid(), params, t0());
        assert_eq!(engine.state(), EscalationState::Completed);
        assert!(engine.next_step_at().is_none());
    }

    #[test]
    fn restart_for_new_session_resets_to_base() {
        let mut engine = EscalationEngine::new();
        engine.start(&sid(), EscalationParams::default(), t0());
        engine.tick(t0() + Duration::seconds(30));
        assert_eq!(engine.volume(), 0.8);

        let next = SessionId::from("sess-next");
        engine.start(&next, EscalationParams::default(), t0() + Duration::minutes(5));
        assert_eq!(engine.volume(), 0.5);
        assert_eq!(engine.session_id(), Some(&next));
    }
}
