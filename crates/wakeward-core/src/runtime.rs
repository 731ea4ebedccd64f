//! Tokio driver for the alarm engine.
//!
//! The engine itself never spawns anything. This module owns the two
//! session-scoped background tasks: one writes a heartbeat every
//! heartbeat interval, the other sleeps until the next escalation step or
//! ring timeout and ticks the engine. Tasks exist only while a session is
//! live and are replaced whenever the active session changes.
//!
//! Cancellation is synchronous with respect to the engine: a task checks
//! its cancel flag while holding the engine lock, and disposal sets that
//! flag under the same lock before aborting the task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::alarm::AlarmSchedule;
use crate::engine::{AlarmEngine, Lifecycle};
use crate::error::Result;
use crate::events::Event;
use crate::scheduler::WakePayload;
use crate::session::SessionId;

/// Poll period of the escalation task when nothing is scheduled.
const IDLE_POLL: std::time::Duration = std::time::Duration::from_secs(1);

/// Source of wall-clock time for the engine.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct SessionTasks {
    session_id: SessionId,
    cancelled: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl SessionTasks {
    fn dispose(self) {
        self.cancelled.store(true, Ordering::SeqCst);
        for handle in self.handles {
            handle.abort();
        }
        tracing::debug!(session_id = %self.session_id, "session tasks disposed");
    }
}

struct Inner {
    engine: Mutex<AlarmEngine>,
    clock: Arc<dyn Clock>,
    tasks: Mutex<Option<SessionTasks>>,
    events: mpsc::UnboundedSender<Event>,
    handle: Handle,
}

impl Inner {
    fn engine(&self) -> MutexGuard<'_, AlarmEngine> {
        self.engine.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, events: Vec<Event>) {
        for event in events {
            // Receiver gone means nobody is listening; not an error.
            let _ = self.events.send(event);
        }
    }
}

/// Shared handle to a running engine.
#[derive(Clone)]
pub struct EngineRuntime {
    inner: Arc<Inner>,
}

impl EngineRuntime {
    /// Wrap `engine`; events produced by any operation or background task
    /// are delivered on the returned receiver.
    pub fn new(
        engine: AlarmEngine,
        clock: Arc<dyn Clock>,
        handle: Handle,
    ) -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runtime = Self {
            inner: Arc::new(Inner {
                engine: Mutex::new(engine),
                clock,
                tasks: Mutex::new(None),
                events: tx,
                handle,
            }),
        };
        (runtime, rx)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Run `op` against the engine at the current time, forward its events
    /// and bring the background tasks in line with the resulting session.
    pub fn apply(
        &self,
        op: impl FnOnce(&mut AlarmEngine, DateTime<Utc>) -> Result<Vec<Event>>,
    ) -> Result<Vec<Event>> {
        let mut engine = self.inner.engine();
        let now = self.inner.clock.now();
        let result = op(&mut *engine, now);
        if let Ok(events) = &result {
            self.inner.emit(events.clone());
        }
        sync_tasks(&self.inner, &engine);
        result
    }

    /// Read-only access to the engine.
    pub fn with_engine<R>(&self, f: impl FnOnce(&AlarmEngine) -> R) -> R {
        let engine = self.inner.engine();
        f(&*engine)
    }

    pub fn startup(&self) -> Result<Vec<Event>> {
        self.apply(|engine, now| {
            let mut events = engine.startup(now)?;
            events.extend(engine.arm_enabled(now)?);
            Ok(events)
        })
    }

    pub fn save_alarm(&self, alarm: &AlarmSchedule) -> Result<Vec<Event>> {
        self.apply(|engine, now| engine.save_alarm(alarm, now).map(|(_, events)| events))
    }

    pub fn on_wake(&self, session_id: &SessionId, payload: Option<&WakePayload>) -> Result<Vec<Event>> {
        self.apply(|engine, now| engine.on_wake(session_id, payload, now))
    }

    pub fn request_proof(&self) -> Result<Vec<Event>> {
        self.apply(|engine, now| engine.request_proof(now))
    }

    pub fn submit_proof(&self, submission: serde_json::Value) -> Result<Vec<Event>> {
        self.apply(|engine, now| engine.submit_proof(submission, now))
    }

    pub fn confirm_dismiss(&self) -> Result<Vec<Event>> {
        self.apply(|engine, now| engine.confirm_dismiss(now))
    }

    pub fn snooze(&self, delay_minutes: Option<u32>) -> Result<Vec<Event>> {
        self.apply(|engine, now| engine.snooze(delay_minutes, now))
    }

    pub fn lifecycle(&self, event: Lifecycle) -> Result<Vec<Event>> {
        self.apply(|engine, now| engine.handle_lifecycle(event, now))
    }

    /// Stop all session tasks. The ledger is left as is, so a session that
    /// was still ringing is reconciled on the next start.
    pub fn shutdown(&self) {
        let mut engine = self.inner.engine();
        engine.dispose();
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tasks) = tasks.take() {
            tasks.dispose();
        }
    }

    /// Whether background tasks are currently running for `session_id`.
    pub fn has_tasks_for(&self, session_id: &SessionId) -> bool {
        self.inner
            .tasks
            .lock()
            .map(|tasks| tasks.as_ref().is_some_and(|t| t.session_id == *session_id))
            .unwrap_or(false)
    }
}

/// Must be called with the engine lock held (lock order: engine, tasks).
fn sync_tasks(inner: &Arc<Inner>, engine: &AlarmEngine) {
    let desired = engine
        .active_session()
        .filter(|s| s.status.is_live())
        .map(|s| s.id.clone());

    let mut tasks = inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
    let current = tasks.as_ref().map(|t| t.session_id.clone());
    if current == desired {
        return;
    }
    if let Some(old) = tasks.take() {
        old.dispose();
    }
    if let Some(session_id) = desired {
        *tasks = Some(spawn_session_tasks(inner, engine, session_id));
    }
}

fn spawn_session_tasks(inner: &Arc<Inner>, engine: &AlarmEngine, session_id: SessionId) -> SessionTasks {
    let cancelled = Arc::new(AtomicBool::new(false));
    let heartbeat_every = engine
        .config()
        .heartbeat_interval()
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(10));

    let heartbeat = inner.handle.spawn(heartbeat_loop(
        Arc::downgrade(inner),
        cancelled.clone(),
        heartbeat_every,
    ));
    let escalation = inner
        .handle
        .spawn(escalation_loop(Arc::downgrade(inner), cancelled.clone()));

    tracing::debug!(session_id = %session_id, "session tasks started");
    SessionTasks {
        session_id,
        cancelled,
        handles: vec![heartbeat, escalation],
    }
}

async fn heartbeat_loop(inner: Weak<Inner>, cancelled: Arc<AtomicBool>, every: std::time::Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + every, every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut engine = inner.engine();
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        let now = inner.clock.now();
        let events = engine.flush_heartbeat(now);
        inner.emit(events);
    }
}

async fn escalation_loop(inner: Weak<Inner>, cancelled: Arc<AtomicBool>) {
    loop {
        let sleep_for = {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let engine = inner.engine();
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            let now = inner.clock.now();
            let next = engine.next_deadline();
            next.and_then(|at| (at - now).to_std().ok())
                .unwrap_or(IDLE_POLL)
        };
        tokio::time::sleep(sleep_for).await;

        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut engine = inner.engine();
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        let now = inner.clock.now();
        let mut events = engine.escalation_tick(now);
        events.extend(engine.check_ring_timeout(now));
        inner.emit(events);
        // A ring timeout ends the session; this disposes the current tasks.
        sync_tasks(&inner, &engine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{DaySet, FireTime};
    use crate::engine::EnginePorts;
    use crate::escalation::NullAudio;
    use crate::scheduler::MemoryDelivery;
    use crate::storage::{Database, EngineConfig};
    use chrono::{NaiveTime, TimeZone};

    /// Wall clock that follows tokio's (pausable) clock.
    struct TokioClock {
        origin: Instant,
        base: DateTime<Utc>,
    }

    impl Clock for TokioClock {
        fn now(&self) -> DateTime<Utc> {
            let elapsed = chrono::Duration::from_std(Instant::now() - self.origin)
                .unwrap_or_else(|_| chrono::Duration::zero());
            self.base + elapsed
        }
    }

    struct Reject;

    impl crate::alarm::ProofVerifier for Reject {
        fn verify(
            &self,
            _context: &crate::alarm::ProofContext,
        ) -> std::result::Result<bool, Box<dyn std::error::Error + Send + Sync>> {
            Ok(false)
        }
    }

    fn runtime() -> (EngineRuntime, mpsc::UnboundedReceiver<Event>) {
        let db = Arc::new(Database::open_memory().unwrap());
        let engine = AlarmEngine::new(
            db,
            EngineConfig::default(),
            EnginePorts {
                delivery: Arc::new(MemoryDelivery::new()),
                verifier: Arc::new(Reject),
                audio: Arc::new(NullAudio),
                senders: Vec::new(),
            },
        )
        .unwrap();
        let clock = Arc::new(TokioClock {
            origin: Instant::now(),
            base: Utc.with_ymd_and_hms(2026, 3, 2, 6, 59, 0).unwrap(),
        });
        EngineRuntime::new(engine, clock, Handle::current())
    }

    fn alarm() -> AlarmSchedule {
        AlarmSchedule::new(
            "a",
            "Wake",
            FireTime::Daily {
                time: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
                days: DaySet::every_day(),
            },
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn ring(rt: &EngineRuntime) -> SessionId {
        rt.startup().unwrap();
        rt.save_alarm(&alarm()).unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        let fire_at = Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).unwrap();
        let sid = SessionId::derive("a", fire_at);
        rt.on_wake(&sid, None).unwrap();
        sid
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_and_escalation_run_while_ringing() {
        let (rt, mut rx) = runtime();
        let sid = ring(&rt).await;
        assert!(rt.has_tasks_for(&sid));
        drain(&mut rx);

        tokio::time::sleep(std::time::Duration::from_secs(31)).await;

        let record = rt.with_engine(|e| e.ledger().read().unwrap().unwrap());
        assert!(rt.now() - record.last_heartbeat_at <= chrono::Duration::seconds(10));

        let volumes: Vec<f64> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                Event::VolumeStepped { volume, .. } => Some(volume),
                _ => None,
            })
            .collect();
        assert_eq!(volumes, vec![0.6, 0.7, 0.8]);
    }

    #[tokio::test(start_paused = true)]
    async fn dismissal_stops_tasks() {
        let (rt, mut rx) = runtime();
        let sid = ring(&rt).await;
        rt.confirm_dismiss().unwrap();
        assert!(!rt.has_tasks_for(&sid));
        drain(&mut rx);

        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        assert!(rt.with_engine(|e| e.ledger().read().unwrap().is_none()));
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, Event::VolumeStepped { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn ring_timeout_snoozes_from_background_task() {
        let (rt, mut rx) = runtime();
        let sid = ring(&rt).await;

        tokio::time::sleep(std::time::Duration::from_secs(601)).await;

        assert!(!rt.has_tasks_for(&sid));
        assert!(rt.with_engine(|e| e.active_session().is_none()));
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, Event::SessionSnoozed { auto: true, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_leaves_ledger_for_reconciliation() {
        let (rt, _rx) = runtime();
        let sid = ring(&rt).await;
        rt.shutdown();
        assert!(!rt.has_tasks_for(&sid));
        let record = rt.with_engine(|e| e.ledger().read().unwrap());
        assert_eq!(record.unwrap().session_id, sid);
    }
}
