//! Alarm engine.
//!
//! Owns the whole lifecycle of a firing: scheduling, the ringing session
//! with its heartbeat and escalation, proof-gated dismissal, snooze with
//! punishment, and the startup reconciliation that punishes a session the
//! previous process abandoned.
//!
//! The engine is wall-clock based and spawns nothing: every operation
//! takes `now` and returns the events it produced.
//! [`crate::runtime::EngineRuntime`] drives the periodic work.
//!
//! ## Session flow
//!
//! ```text
//! on_wake -> Ringing --request_proof--> ProofPending --submit_proof--> Dismissed
//!            Ringing --confirm_dismiss--> Dismissed
//!            Ringing | ProofPending --snooze / ring timeout--> Snoozed -> PunishmentDispatched
//! startup:   stale Ringing | ProofPending record -> Interrupted -> PunishmentDispatched
//! ```
//!
//! At most one session rings at a time; further wakes queue up behind it.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::alarm::{AlarmSchedule, AlarmStore, EscalationFlags, ProofContext, ProofVerifier};
use crate::error::{CoreError, Result, ValidationError};
use crate::escalation::{AudioOutput, EscalationEngine, EscalationState, VolumeStep};
use crate::events::Event;
use crate::heartbeat::{
    HeartbeatLedger, HeartbeatRecord, ReconcileConfig, ReconciliationChecker,
    ReconciliationOutcome, ReconciliationReport,
};
use crate::punishment::{
    ChannelSender, PunishmentConfig, PunishmentContext, PunishmentDispatcher, PunishmentReason,
};
use crate::scheduler::{Scheduler, SchedulerConfig, TimerHandle, TimerKind, WakeDelivery, WakePayload};
use crate::session::{Session, SessionId, SessionStatus};
use crate::storage::{EngineConfig, KvStore};

/// Settled-session markers are kept this long; orphan wakes for older
/// firings are ignored.
const SETTLED_RETENTION_DAYS: i64 = 7;

/// Process lifecycle signals fed in by the host shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    ProcessStarted,
    Foregrounded,
    Backgrounded,
}

/// Platform adapters the engine talks to.
pub struct EnginePorts {
    pub delivery: Arc<dyn WakeDelivery>,
    pub verifier: Arc<dyn ProofVerifier>,
    pub audio: Arc<dyn AudioOutput>,
    pub senders: Vec<Arc<dyn ChannelSender>>,
}

/// Timer state scoped to the ringing session.
struct ActiveSession {
    session: Session,
    proof: ProofContext,
    /// Snapshot taken at fire time; the alarm may be edited while ringing.
    alarm: Option<AlarmSchedule>,
    escalation: EscalationEngine,
    last_heartbeat_at: DateTime<Utc>,
    /// False after a failed ledger write; the next tick retries.
    ledger_synced: bool,
}

impl ActiveSession {
    fn dispose(&mut self, audio: &dyn AudioOutput) {
        self.escalation.stop(&self.session.id);
        audio.set_volume(&self.session.id, 0.0);
    }

    fn punishment(&self) -> PunishmentConfig {
        self.alarm
            .as_ref()
            .map(|a| a.punishment.clone())
            .unwrap_or_default()
    }
}

pub struct AlarmEngine {
    config: EngineConfig,
    store: AlarmStore,
    ledger: Arc<HeartbeatLedger>,
    scheduler: Scheduler,
    dispatcher: PunishmentDispatcher,
    checker: ReconciliationChecker,
    verifier: Arc<dyn ProofVerifier>,
    audio: Arc<dyn AudioOutput>,
    active: Option<ActiveSession>,
    queued: VecDeque<TimerHandle>,
    startup: Option<ReconciliationReport>,
}

impl AlarmEngine {
    pub fn new(kv: Arc<dyn KvStore>, config: EngineConfig, ports: EnginePorts) -> Result<Self> {
        config.validate()?;

        let ledger = Arc::new(HeartbeatLedger::new(kv.clone()));
        let scheduler = Scheduler::new(
            ports.delivery,
            ledger.clone(),
            SchedulerConfig {
                utc_offset: config.utc_offset(),
                backup_offset: config.backup_offset(),
                snooze_anchor: config.snooze_anchor,
            },
        );
        let checker = ReconciliationChecker::new(
            ledger.clone(),
            ReconcileConfig {
                stale_threshold: config.stale_threshold(),
                max_clock_drift: config.max_clock_drift(),
            },
        );
        let dispatcher =
            PunishmentDispatcher::with_senders(kv.clone(), config.max_channels, ports.senders);

        Ok(Self {
            store: AlarmStore::new(kv, config.max_channels),
            config,
            ledger,
            scheduler,
            dispatcher,
            checker,
            verifier: ports.verifier,
            audio: ports.audio,
            active: None,
            queued: VecDeque::new(),
            startup: None,
        })
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &AlarmStore {
        &self.store
    }

    pub fn ledger(&self) -> &HeartbeatLedger {
        &self.ledger
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &PunishmentDispatcher {
        &self.dispatcher
    }

    pub fn is_reconciled(&self) -> bool {
        self.startup.is_some()
    }

    pub fn startup_report(&self) -> Option<&ReconciliationReport> {
        self.startup.as_ref()
    }

    pub fn active_session(&self) -> Option<&Session> {
        self.active.as_ref().map(|a| &a.session)
    }

    pub fn proof_context(&self) -> Option<&ProofContext> {
        self.active.as_ref().map(|a| &a.proof)
    }

    pub fn volume(&self) -> Option<f64> {
        self.active.as_ref().map(|a| a.escalation.volume())
    }

    pub fn escalation_state(&self) -> EscalationState {
        self.active
            .as_ref()
            .map(|a| a.escalation.state())
            .unwrap_or(EscalationState::Idle)
    }

    pub fn next_volume_step_at(&self) -> Option<DateTime<Utc>> {
        self.active.as_ref().and_then(|a| a.escalation.next_step_at())
    }

    /// Earliest instant at which `tick` has escalation or ring-timeout
    /// work to do for the active session.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let active = self.active.as_ref()?;
        let timeout = self
            .config
            .ring_timeout()
            .filter(|_| active.session.status.is_live())
            .map(|timeout| active.session.started_at + timeout);
        [active.escalation.next_step_at(), timeout]
            .into_iter()
            .flatten()
            .min()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    // ── Startup ──────────────────────────────────────────────────────

    /// Run reconciliation once for this process.
    ///
    /// An interrupted session is punished and its record cleared; a
    /// still-active one is resumed with escalation restarted at the base
    /// volume. Until this succeeds, `arm` fails with `NotReconciled`.
    pub fn startup(&mut self, now: DateTime<Utc>) -> Result<Vec<Event>> {
        if self.startup.is_some() {
            return Ok(Vec::new());
        }

        let report = self.checker.check_on_startup(now)?;
        let mut events = vec![Event::Reconciled {
            outcome: outcome_name(&report.outcome).to_string(),
            session_id: report.outcome.record().map(|r| r.session_id.clone()),
            at: now,
        }];
        events.extend(report.anomalies.iter().map(|anomaly| Event::AnomalyDetected {
            anomaly: anomaly.clone(),
            at: now,
        }));

        match &report.outcome {
            ReconciliationOutcome::Interrupted { record } => {
                events.extend(self.punish_interrupted(record, now)?);
            }
            ReconciliationOutcome::StillActive { record } => {
                events.extend(self.resume(record, now)?);
            }
            ReconciliationOutcome::NoPriorSession | ReconciliationOutcome::CleanlyClosed { .. } => {}
        }

        if let Err(e) = self.ledger.prune_settled(now - Duration::days(SETTLED_RETENTION_DAYS)) {
            tracing::warn!(error = %e, "failed to prune settled session markers");
        }

        tracing::info!(outcome = outcome_name(&report.outcome), "startup reconciliation complete");
        self.startup = Some(report);
        Ok(events)
    }

    fn punish_interrupted(&mut self, record: &HeartbeatRecord, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let alarm = self.store.get(&record.alarm_id)?;
        let mut session = session_from_record(record);
        let reason = if session.status == SessionStatus::Snoozed {
            PunishmentReason::Snoozed
        } else {
            if session.status.is_live() {
                session.interrupt()?;
            }
            PunishmentReason::Interrupted
        };

        let config = alarm.as_ref().map(|a| a.punishment.clone()).unwrap_or_default();
        let context = punishment_context(&session, alarm.as_ref(), reason, now);
        let mut events = Vec::new();

        match self.dispatcher.dispatch(&session.id, &config, &context) {
            Ok(result) => {
                session.mark_punished()?;
                events.push(Event::PunishmentDispatched {
                    session_id: session.id.clone(),
                    reason,
                    triggered: result.triggered(),
                    failed: result.failed(),
                    already_dispatched: result.already_dispatched,
                    at: now,
                });
                if let Err(e) = self.ledger.clear_session(&session.id) {
                    tracing::error!(session_id = %session.id, error = %e, "failed to clear ledger after dispatch");
                }
            }
            Err(e) => {
                // Record stays; the next start retries and the marker dedups.
                tracing::error!(session_id = %session.id, error = %e, "punishment dispatch failed at startup");
            }
        }
        Ok(events)
    }

    fn resume(&mut self, record: &HeartbeatRecord, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let alarm = self.store.get(&record.alarm_id)?;
        let session = session_from_record(record);
        self.scheduler.record_fired(TimerHandle::from_payload(
            &session.id,
            &WakePayload {
                alarm_id: session.alarm_id.clone(),
                label: session.label.clone(),
                kind: if session.snooze_count > 0 {
                    TimerKind::Snooze
                } else {
                    TimerKind::Primary
                },
                fire_at: session.fire_at,
                snooze_count: session.snooze_count,
            },
        ));

        let mut events = vec![Event::SessionResumed {
            session_id: session.id.clone(),
            status: session.status,
            at: now,
        }];
        events.extend(self.activate(session, record.proof_context.clone(), alarm, now, false));
        Ok(events)
    }

    // ── Alarm management ─────────────────────────────────────────────

    fn ensure_reconciled(&self) -> Result<()> {
        if self.startup.is_none() {
            return Err(CoreError::NotReconciled);
        }
        Ok(())
    }

    /// Arm the next occurrence of a stored alarm.
    pub fn arm(&mut self, alarm_id: &str, now: DateTime<Utc>) -> Result<TimerHandle> {
        self.ensure_reconciled()?;
        let alarm = self.store.require(alarm_id)?;
        if !alarm.enabled {
            return Err(ValidationError::InvalidValue {
                field: "enabled".into(),
                message: format!("alarm '{alarm_id}' is disabled"),
            }
            .into());
        }
        self.scheduler.arm(&alarm, now)
    }

    /// Arm every enabled alarm. Individual failures are reported as
    /// `RearmFailed` events rather than aborting the rest.
    pub fn arm_enabled(&mut self, now: DateTime<Utc>) -> Result<Vec<Event>> {
        self.ensure_reconciled()?;
        let mut events = Vec::new();
        for alarm in self.store.enabled()? {
            match self.scheduler.arm(&alarm, now) {
                Ok(handle) => events.push(armed_event(&handle)),
                Err(e) => {
                    tracing::warn!(alarm_id = %alarm.id, error = %e, "failed to arm alarm");
                    events.push(Event::RearmFailed {
                        alarm_id: alarm.id.clone(),
                        error: e.to_string(),
                        at: now,
                    });
                }
            }
        }
        Ok(events)
    }

    /// Validate and store an alarm, arming or disarming it to match its
    /// enabled flag once reconciliation has run.
    pub fn save_alarm(&mut self, alarm: &AlarmSchedule, now: DateTime<Utc>) -> Result<(AlarmSchedule, Vec<Event>)> {
        let stored = self.store.put(alarm, now)?;
        let mut events = Vec::new();
        if self.startup.is_some() {
            if stored.enabled {
                let handle = self.scheduler.arm(&stored, now)?;
                events.push(armed_event(&handle));
            } else {
                events.extend(self.disarm(&stored.id, now)?);
            }
        }
        Ok((stored, events))
    }

    pub fn set_enabled(&mut self, alarm_id: &str, enabled: bool, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let alarm = self.store.set_enabled(alarm_id, enabled, now)?;
        if self.startup.is_none() {
            return Ok(Vec::new());
        }
        if enabled {
            let handle = self.scheduler.arm(&alarm, now)?;
            Ok(vec![armed_event(&handle)])
        } else {
            self.disarm(alarm_id, now)
        }
    }

    /// Cancel all pending wakes of an alarm and clear its heartbeat
    /// record. A ringing session of that alarm is stopped and settled; the
    /// next queued fire, if any, starts ringing.
    pub fn disarm(&mut self, alarm_id: &str, now: DateTime<Utc>) -> Result<Vec<Event>> {
        self.scheduler.disarm(alarm_id)?;
        self.queued.retain(|h| h.alarm_id != alarm_id);
        let mut events = vec![Event::AlarmDisarmed {
            alarm_id: alarm_id.to_string(),
            at: now,
        }];

        if self.active_alarm_id() == Some(alarm_id) {
            if let Some(mut active) = self.active.take() {
                let session = &active.session;
                if let Err(e) = self.ledger.settle(&session.id, session.fire_at, now) {
                    tracing::warn!(session_id = %session.id, error = %e, "failed to settle disarmed session");
                }
                tracing::info!(session_id = %session.id, alarm_id, "ringing session disarmed");
                active.dispose(self.audio.as_ref());
            }
            events.extend(self.start_next_queued(now));
        }
        Ok(events)
    }

    pub fn delete_alarm(&mut self, alarm_id: &str, now: DateTime<Utc>) -> Result<bool> {
        if self.startup.is_some() {
            self.disarm(alarm_id, now)?;
        }
        Ok(self.store.delete(alarm_id)?)
    }

    fn active_alarm_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.session.alarm_id.as_str())
    }

    // ── Firing ───────────────────────────────────────────────────────

    /// Handle an OS wake for `session_id`.
    ///
    /// Duplicate deliveries (the backup wake, a repeated callback) are
    /// ignored. A wake arriving while another session rings is queued.
    /// `payload` lets a process that lost its handles, e.g. one launched by
    /// the wake itself, still ring the right alarm.
    pub fn on_wake(
        &mut self,
        session_id: &SessionId,
        payload: Option<&WakePayload>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Event>> {
        self.ensure_reconciled()?;

        let duplicate = self.active.as_ref().is_some_and(|a| a.session.id == *session_id)
            || self.queued.iter().any(|h| h.session_id == *session_id);
        if duplicate {
            tracing::debug!(session_id = %session_id, "duplicate wake ignored");
            return Ok(vec![Event::DuplicateWakeIgnored {
                session_id: session_id.clone(),
                at: now,
            }]);
        }

        let handle = match self.scheduler.take_fired(session_id) {
            Some(handle) => handle,
            None => {
                if self.scheduler.was_fired(session_id)
                    || self.dispatcher.is_dispatched(session_id)
                    || self.ledger.is_settled(session_id)?
                {
                    tracing::debug!(session_id = %session_id, "wake for handled session ignored");
                    return Ok(vec![Event::DuplicateWakeIgnored {
                        session_id: session_id.clone(),
                        at: now,
                    }]);
                }
                match self.orphan_handle(session_id, payload, now)? {
                    Some(handle) => {
                        self.scheduler.record_fired(handle.clone());
                        handle
                    }
                    None => {
                        tracing::warn!(session_id = %session_id, "wake matches no pending firing");
                        return Ok(vec![Event::WakeIgnored {
                            session_id: session_id.clone(),
                            reason: "no pending firing".into(),
                            at: now,
                        }]);
                    }
                }
            }
        };

        let mut events = self.after_fire(&handle, now);

        if self.active.is_some() {
            tracing::info!(session_id = %handle.session_id, "session active, queueing fire");
            events.push(Event::FireQueued {
                alarm_id: handle.alarm_id.clone(),
                session_id: handle.session_id.clone(),
                at: now,
            });
            self.queued.push_back(handle);
            return Ok(events);
        }

        events.extend(self.start_session(handle, now));
        Ok(events)
    }

    fn orphan_handle(
        &self,
        session_id: &SessionId,
        payload: Option<&WakePayload>,
        now: DateTime<Utc>,
    ) -> Result<Option<TimerHandle>> {
        let Some(payload) = payload else {
            return Ok(None);
        };
        if SessionId::derive(&payload.alarm_id, payload.fire_at) != *session_id {
            return Ok(None);
        }
        // Older than any settled marker we still keep.
        if payload.fire_at < now - Duration::days(SETTLED_RETENTION_DAYS) {
            return Ok(None);
        }
        let known = match self.store.get(&payload.alarm_id)? {
            Some(alarm) => alarm.enabled || payload.kind == TimerKind::Snooze,
            None => false,
        };
        Ok(known.then(|| TimerHandle::from_payload(session_id, payload)))
    }

    /// Re-arm a recurring alarm for its next occurrence, or disable a
    /// one-shot alarm that just fired.
    fn after_fire(&mut self, handle: &TimerHandle, now: DateTime<Utc>) -> Vec<Event> {
        if handle.kind != TimerKind::Primary {
            return Vec::new();
        }
        let alarm = match self.store.get(&handle.alarm_id) {
            Ok(Some(alarm)) => alarm,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::error!(alarm_id = %handle.alarm_id, error = %e, "failed to load fired alarm");
                return vec![Event::RearmFailed {
                    alarm_id: handle.alarm_id.clone(),
                    error: e.to_string(),
                    at: now,
                }];
            }
        };

        if alarm.fire_time.is_one_shot() {
            if let Err(e) = self.store.set_enabled(&alarm.id, false, now) {
                tracing::error!(alarm_id = %alarm.id, error = %e, "failed to disable one-shot alarm");
            }
            return Vec::new();
        }
        if !alarm.enabled {
            return Vec::new();
        }
        // An early wake must not re-arm the instant that is firing now.
        match self.scheduler.arm(&alarm, now.max(handle.fire_at)) {
            Ok(next) => vec![armed_event(&next)],
            Err(e) => {
                tracing::error!(alarm_id = %alarm.id, error = %e, "failed to re-arm recurring alarm");
                vec![Event::RearmFailed {
                    alarm_id: alarm.id.clone(),
                    error: e.to_string(),
                    at: now,
                }]
            }
        }
    }

    fn start_session(&mut self, handle: TimerHandle, now: DateTime<Utc>) -> Vec<Event> {
        let alarm = match self.store.get(&handle.alarm_id) {
            Ok(alarm) => alarm,
            Err(e) => {
                // Ring with defaults rather than stay silent.
                tracing::error!(alarm_id = %handle.alarm_id, error = %e, "failed to load alarm for ringing session");
                None
            }
        };
        let session = Session::new(
            &handle.alarm_id,
            &handle.label,
            handle.fire_at,
            now,
            handle.snooze_count,
        );
        let proof = ProofContext::new(
            session.id.clone(),
            &session.alarm_id,
            alarm.as_ref().and_then(|a| a.proof.clone()),
        );

        let mut events = vec![Event::AlarmFired {
            alarm_id: session.alarm_id.clone(),
            session_id: session.id.clone(),
            label: session.label.clone(),
            fire_at: session.fire_at,
            at: now,
        }];
        events.extend(self.activate(session, proof, alarm, now, true));
        events
    }

    /// Install `session` as the active one: open the ledger record and
    /// start escalation at the base volume.
    fn activate(
        &mut self,
        mut session: Session,
        proof: ProofContext,
        alarm: Option<AlarmSchedule>,
        now: DateTime<Utc>,
        open_ledger: bool,
    ) -> Vec<Event> {
        let mut events = Vec::new();

        let ledger_result = if open_ledger {
            self.ledger.begin_session(&session, proof.clone(), now).map(|_| true)
        } else {
            self.ledger.heartbeat(&session.id, now)
        };
        let ledger_synced = match ledger_result {
            Ok(synced) => synced,
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "failed to write heartbeat record");
                events.push(Event::HeartbeatFailed {
                    session_id: session.id.clone(),
                    error: e.to_string(),
                    at: now,
                });
                false
            }
        };

        let params = alarm
            .as_ref()
            .map(|a| a.escalation.clone())
            .unwrap_or_else(EscalationFlags::default)
            .params(&self.config.escalation);
        let mut escalation = EscalationEngine::new();
        let step = escalation.start(&session.id, params, now);
        self.audio.set_volume(&session.id, step.volume);
        session.volume = step.volume;
        events.push(volume_event(&step));

        tracing::info!(
            session_id = %session.id,
            alarm_id = %session.alarm_id,
            status = ?session.status,
            volume = step.volume,
            "session ringing"
        );

        self.active = Some(ActiveSession {
            session,
            proof,
            alarm,
            escalation,
            last_heartbeat_at: now,
            ledger_synced,
        });
        events
    }

    // ── Periodic work ────────────────────────────────────────────────

    /// All periodic work: heartbeat when due, escalation steps, ring timeout.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        let mut events = self.heartbeat_tick(now);
        events.extend(self.escalation_tick(now));
        events.extend(self.check_ring_timeout(now));
        events
    }

    /// Heartbeat if an interval has elapsed since the last successful
    /// write, or immediately after a failed one.
    pub fn heartbeat_tick(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        let interval = self.config.heartbeat_interval();
        let due = self
            .active
            .as_ref()
            .is_some_and(|a| !a.ledger_synced || now - a.last_heartbeat_at >= interval);
        if due {
            self.flush_heartbeat(now)
        } else {
            Vec::new()
        }
    }

    /// Write a heartbeat now. Failures are logged and retried on the next
    /// tick; they never interrupt escalation.
    pub fn flush_heartbeat(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        if !active.session.status.is_live() {
            return Vec::new();
        }

        let result = match self.ledger.heartbeat(&active.session.id, now) {
            // Record missing (earlier write failed); reopen it.
            Ok(false) => self
                .ledger
                .begin_session(&active.session, active.proof.clone(), now)
                .map(|_| ()),
            Ok(true) => Ok(()),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                active.last_heartbeat_at = now;
                active.ledger_synced = true;
                tracing::trace!(session_id = %active.session.id, "heartbeat");
                Vec::new()
            }
            Err(e) => {
                active.ledger_synced = false;
                tracing::warn!(session_id = %active.session.id, error = %e, "heartbeat write failed");
                vec![Event::HeartbeatFailed {
                    session_id: active.session.id.clone(),
                    error: e.to_string(),
                    at: now,
                }]
            }
        }
    }

    pub fn escalation_tick(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };
        let was_running = active.escalation.is_running();
        let steps = active.escalation.tick(now);
        let mut events = Vec::with_capacity(steps.len() + 1);
        for step in &steps {
            self.audio.set_volume(&step.session_id, step.volume);
            active.session.volume = step.volume;
            events.push(volume_event(step));
        }
        if was_running && active.escalation.state() == EscalationState::Completed {
            events.push(Event::EscalationCompleted {
                session_id: active.session.id.clone(),
                volume: active.escalation.volume(),
                at: now,
            });
        }
        events
    }

    /// Auto-snooze a session nobody has acted on within the ring timeout.
    pub fn check_ring_timeout(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        let Some(timeout) = self.config.ring_timeout() else {
            return Vec::new();
        };
        let expired = self
            .active
            .as_ref()
            .is_some_and(|a| a.session.status.is_live() && now - a.session.started_at >= timeout);
        if !expired {
            return Vec::new();
        }
        tracing::info!("ring timeout reached, auto-snoozing");
        match self.snooze_inner(None, true, now) {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(error = %e, "auto-snooze failed");
                Vec::new()
            }
        }
    }

    // ── Session actions ──────────────────────────────────────────────

    fn active_mut(&mut self) -> Result<&mut ActiveSession> {
        self.active.as_mut().ok_or(CoreError::NoActiveSession)
    }

    /// Ringing -> ProofPending for an alarm with a proof requirement.
    pub fn request_proof(&mut self, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let active = self.active_mut()?;
        let Some(requirement) = active.proof.requirement.clone() else {
            return Err(CoreError::InvalidTransition {
                from: active.session.status,
                action: "request proof for an alarm without a proof requirement",
            });
        };
        active.session.require_proof()?;
        let session_id = active.session.id.clone();

        if let Err(e) = self
            .ledger
            .set_status(&session_id, SessionStatus::ProofPending, now)
        {
            tracing::warn!(session_id = %session_id, error = %e, "failed to record proof-pending status");
            if let Some(active) = self.active.as_mut() {
                active.ledger_synced = false;
            }
        }
        tracing::info!(session_id = %session_id, proof = requirement.name(), "proof requested");
        Ok(vec![Event::ProofRequested {
            session_id,
            requirement: requirement.name().to_string(),
            at: now,
        }])
    }

    /// Verify a proof submission; dismisses the session on success.
    ///
    /// A rejected proof leaves the session in `ProofPending`; a verifier
    /// error is returned as `CoreError::Verification` with the session
    /// likewise left pending.
    pub fn submit_proof(&mut self, submission: serde_json::Value, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        let needs_request = {
            let active = self.active_mut()?;
            active.session.status == SessionStatus::Ringing && active.proof.requires_proof()
        };
        if needs_request {
            events.extend(self.request_proof(now)?);
        }

        let active = self.active.as_mut().ok_or(CoreError::NoActiveSession)?;
        if active.session.status != SessionStatus::ProofPending {
            return Err(CoreError::InvalidTransition {
                from: active.session.status,
                action: "submit proof",
            });
        }
        active.proof.submission = Some(submission);
        let session_id = active.session.id.clone();

        match self.verifier.verify(&active.proof) {
            Ok(true) => {
                events.extend(self.finish_dismiss(now)?);
                Ok(events)
            }
            Ok(false) => {
                tracing::info!(session_id = %session_id, "proof rejected");
                events.push(Event::ProofRejected {
                    session_id,
                    reason: "proof did not match".into(),
                    at: now,
                });
                Ok(events)
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "proof verifier failed");
                Err(CoreError::Verification(e.to_string()))
            }
        }
    }

    /// Dismiss a session whose alarm requires no proof.
    pub fn confirm_dismiss(&mut self, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let active = self.active_mut()?;
        if active.proof.requires_proof() {
            return Err(CoreError::InvalidTransition {
                from: active.session.status,
                action: "dismiss without proof",
            });
        }
        self.finish_dismiss(now)
    }

    /// Dismissed is written durably before the record is cleared, so a
    /// crash in between reconciles as cleanly closed. If the durable write
    /// fails the session keeps ringing and the error is returned.
    fn finish_dismiss(&mut self, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let active = self.active_mut()?;
        let mut session = active.session.clone();
        session.dismiss()?;

        self.ledger.mark_dismissed(&session.id, now)?;
        if let Err(e) = self.ledger.settle(&session.id, session.fire_at, now) {
            tracing::warn!(session_id = %session.id, error = %e, "failed to settle dismissed session");
        }
        if let Err(e) = self.ledger.clear_session(&session.id) {
            tracing::warn!(session_id = %session.id, error = %e, "failed to clear dismissed ledger record");
        }

        if let Some(mut active) = self.active.take() {
            active.session = session.clone();
            active.dispose(self.audio.as_ref());
        }
        tracing::info!(session_id = %session.id, alarm_id = %session.alarm_id, "session dismissed");

        let mut events = vec![Event::SessionDismissed {
            session_id: session.id,
            alarm_id: session.alarm_id,
            at: now,
        }];
        events.extend(self.start_next_queued(now));
        Ok(events)
    }

    /// Snooze the ringing session: punish, clear the record, and arm a
    /// one-shot re-fire after `delay_minutes` (alarm or engine default when
    /// `None`).
    pub fn snooze(&mut self, delay_minutes: Option<u32>, now: DateTime<Utc>) -> Result<Vec<Event>> {
        self.snooze_inner(delay_minutes, false, now)
    }

    fn snooze_inner(&mut self, delay_minutes: Option<u32>, auto: bool, now: DateTime<Utc>) -> Result<Vec<Event>> {
        let active = self.active_mut()?;
        let mut session = active.session.clone();
        session.snooze()?;
        let config = active.punishment();
        let alarm = active.alarm.clone();

        if let Err(e) = self.ledger.set_status(&session.id, SessionStatus::Snoozed, now) {
            tracing::warn!(session_id = %session.id, error = %e, "failed to record snoozed status");
        }

        let context = punishment_context(&session, alarm.as_ref(), PunishmentReason::Snoozed, now);
        let mut events = Vec::new();
        match self.dispatcher.dispatch(&session.id, &config, &context) {
            Ok(result) => {
                session.mark_punished()?;
                events.push(Event::PunishmentDispatched {
                    session_id: session.id.clone(),
                    reason: PunishmentReason::Snoozed,
                    triggered: result.triggered(),
                    failed: result.failed(),
                    already_dispatched: result.already_dispatched,
                    at: now,
                });
                if let Err(e) = self.ledger.clear_session(&session.id) {
                    tracing::warn!(session_id = %session.id, error = %e, "failed to clear ledger after snooze");
                }
            }
            Err(e) => {
                // The Snoozed record is left for reconciliation to punish.
                tracing::error!(session_id = %session.id, error = %e, "snooze punishment dispatch failed");
            }
        }

        if let Some(mut active) = self.active.take() {
            active.session = session.clone();
            active.dispose(self.audio.as_ref());
        }

        let delay = delay_minutes
            .or_else(|| alarm.as_ref().and_then(|a| a.snooze_minutes))
            .unwrap_or(self.config.default_snooze_minutes);
        let (next_session_id, next_fire_at) =
            match self.scheduler.rearm_snooze(&session.alarm_id, delay, now) {
                Ok(handle) => {
                    events.push(armed_event(&handle));
                    (Some(handle.session_id), Some(handle.fire_at))
                }
                Err(e) => {
                    tracing::error!(alarm_id = %session.alarm_id, error = %e, "failed to arm snooze");
                    events.push(Event::RearmFailed {
                        alarm_id: session.alarm_id.clone(),
                        error: e.to_string(),
                        at: now,
                    });
                    (None, None)
                }
            };

        tracing::info!(
            session_id = %session.id,
            next_fire_at = ?next_fire_at,
            auto,
            "session snoozed"
        );
        events.insert(
            0,
            Event::SessionSnoozed {
                session_id: session.id.clone(),
                alarm_id: session.alarm_id.clone(),
                next_fire_at,
                next_session_id,
                auto,
                at: now,
            },
        );
        events.extend(self.start_next_queued(now));
        Ok(events)
    }

    fn start_next_queued(&mut self, now: DateTime<Utc>) -> Vec<Event> {
        while let Some(handle) = self.queued.pop_front() {
            if self.dispatcher.is_dispatched(&handle.session_id) {
                continue;
            }
            return self.start_session(handle, now);
        }
        Vec::new()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn handle_lifecycle(&mut self, event: Lifecycle, now: DateTime<Utc>) -> Result<Vec<Event>> {
        match event {
            Lifecycle::ProcessStarted => self.startup(now),
            Lifecycle::Foregrounded | Lifecycle::Backgrounded => {
                tracing::debug!(lifecycle = ?event, "flushing heartbeat");
                Ok(self.flush_heartbeat(now))
            }
        }
    }

    /// Stop session timers without touching the ledger. Used on process
    /// shutdown: a session left ringing is reconciled on the next start.
    pub fn dispose(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.escalation.stop(&active.session.id);
        }
    }
}

fn session_from_record(record: &HeartbeatRecord) -> Session {
    Session {
        id: record.session_id.clone(),
        alarm_id: record.alarm_id.clone(),
        label: record.label.clone(),
        status: record.status,
        fire_at: record.fire_at,
        started_at: record.started_at,
        volume: 0.0,
        snooze_count: record.snooze_count,
    }
}

fn punishment_context(
    session: &Session,
    alarm: Option<&AlarmSchedule>,
    reason: PunishmentReason,
    now: DateTime<Utc>,
) -> PunishmentContext {
    let snooze_count = match reason {
        PunishmentReason::Snoozed => session.snooze_count + 1,
        PunishmentReason::Interrupted => session.snooze_count,
    };
    PunishmentContext {
        session_id: session.id.clone(),
        alarm_id: session.alarm_id.clone(),
        label: session.label.clone(),
        reason,
        stake_amount: alarm.map(|a| a.stake_amount).unwrap_or(0),
        snooze_count,
        occurred_at: now,
    }
}

fn outcome_name(outcome: &ReconciliationOutcome) -> &'static str {
    match outcome {
        ReconciliationOutcome::NoPriorSession => "no_prior_session",
        ReconciliationOutcome::CleanlyClosed { .. } => "cleanly_closed",
        ReconciliationOutcome::Interrupted { .. } => "interrupted",
        ReconciliationOutcome::StillActive { .. } => "still_active",
    }
}

fn armed_event(handle: &TimerHandle) -> Event {
    Event::AlarmArmed {
        alarm_id: handle.alarm_id.clone(),
        session_id: handle.session_id.clone(),
        fire_at: handle.fire_at,
        kind: handle.kind,
    }
}

fn volume_event(step: &VolumeStep) -> Event {
    Event::VolumeStepped {
        session_id: step.session_id.clone(),
        step: step.step,
        volume: step.volume,
        at: step.at,
    }
}
