//! # Wakeward Core Library
//!
//! This library provides the alarm lifecycle of the Wakeward accountability
//! alarm: scheduling, ringing with escalating volume, proof-gated dismissal,
//! and punishment of snoozes. It is built so that force-closing the app
//! while an alarm rings is treated exactly like snoozing it.
//!
//! ## Architecture
//!
//! - **Alarm Engine**: A wall-clock-based state machine that requires the caller
//!   to pass `now` into every operation and to periodically invoke `tick()`
//! - **Heartbeat Ledger**: A single durable liveness record for the ringing
//!   session, checked once at startup by the reconciliation checker
//! - **Punishment Dispatcher**: Exactly-once fan-out to consequence channels
//! - **Storage**: SQLite-backed key-value store and TOML-based configuration
//! - **Runtime**: Tokio tasks that drive heartbeats and escalation
//!
//! ## Key Components
//!
//! - [`AlarmEngine`]: Session state machine and startup reconciliation
//! - [`Scheduler`]: OS wake scheduling through the [`WakeDelivery`] port
//! - [`HeartbeatLedger`]: Durable heartbeat record
//! - [`PunishmentDispatcher`]: Idempotent punishment dispatch
//! - [`Database`]: SQLite implementation of [`KvStore`]
//! - [`EngineConfig`]: Engine configuration management

pub mod alarm;
pub mod engine;
pub mod error;
pub mod escalation;
pub mod events;
pub mod heartbeat;
pub mod punishment;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod storage;

pub use alarm::{
    AlarmSchedule, AlarmStore, DaySet, EscalationFlags, FireTime, ProofContext, ProofRequirement,
    ProofVerifier,
};
pub use engine::{AlarmEngine, EnginePorts, Lifecycle};
pub use error::{ConfigError, CoreError, DeliveryError, StoreError, ValidationError};
pub use escalation::{AudioOutput, EscalationEngine, EscalationParams, EscalationState, NullAudio, VolumeStep};
pub use events::Event;
pub use heartbeat::{
    Anomaly, HeartbeatLedger, HeartbeatRecord, ReconcileConfig, ReconciliationChecker, ReconciliationOutcome,
    ReconciliationReport,
};
pub use punishment::{
    ChannelConfig, ChannelKind, ChannelSender, DispatchResult, PunishmentConfig, PunishmentContext,
    PunishmentDispatcher, PunishmentReason,
};
pub use runtime::{Clock, EngineRuntime, SystemClock};
pub use scheduler::{MemoryDelivery, Scheduler, TimerHandle, TimerKind, WakeDelivery, WakePayload, WakeToken};
pub use session::{Session, SessionId, SessionStatus};
pub use storage::{Database, EngineConfig, KvStore, SnoozeAnchor};
