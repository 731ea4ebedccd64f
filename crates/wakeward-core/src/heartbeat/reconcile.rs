//! Startup reconciliation of a leftover heartbeat record.
//!
//! Compares the age of the last heartbeat against the stale threshold to
//! decide whether the previous process closed its session properly or was
//! killed mid-alarm. Force-closing the app must not be a way out of the
//! punishment, so an interrupted session is handed back to the caller for
//! dispatch.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::ledger::{HeartbeatLedger, HeartbeatRecord};
use crate::error::StoreError;
use crate::session::{SessionId, SessionStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconciliationOutcome {
    NoPriorSession,
    /// The record was already settled; it has been deleted.
    CleanlyClosed { record: HeartbeatRecord },
    /// Heartbeat went stale while ringing; punishment is owed.
    Interrupted { record: HeartbeatRecord },
    /// Heartbeat is fresh; the record was left untouched.
    StillActive { record: HeartbeatRecord },
}

impl ReconciliationOutcome {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ReconciliationOutcome::Interrupted { .. })
    }

    pub fn record(&self) -> Option<&HeartbeatRecord> {
        match self {
            ReconciliationOutcome::NoPriorSession => None,
            ReconciliationOutcome::CleanlyClosed { record }
            | ReconciliationOutcome::Interrupted { record }
            | ReconciliationOutcome::StillActive { record } => Some(record),
        }
    }
}

/// Tamper signals. Only `StaleHeartbeat` drives punishment; the others are
/// advisory and only logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    StaleHeartbeat {
        session_id: SessionId,
        age_secs: i64,
    },
    /// Elapsed time since the last heartbeat is negative or implausibly long.
    ClockDrift {
        session_id: SessionId,
        elapsed_secs: i64,
    },
    CorruptLedger { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub outcome: ReconciliationOutcome,
    pub anomalies: Vec<Anomaly>,
    pub checked_at: DateTime<Utc>,
}

impl ReconciliationReport {
    fn new(outcome: ReconciliationOutcome, checked_at: DateTime<Utc>) -> Self {
        Self {
            outcome,
            anomalies: Vec::new(),
            checked_at,
        }
    }
}

/// Configuration for reconciliation behavior.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub stale_threshold: Duration,
    pub max_clock_drift: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::seconds(30),
            max_clock_drift: Duration::hours(24),
        }
    }
}

pub struct ReconciliationChecker {
    ledger: Arc<HeartbeatLedger>,
    config: ReconcileConfig,
}

impl ReconciliationChecker {
    pub fn new(ledger: Arc<HeartbeatLedger>, config: ReconcileConfig) -> Self {
        Self { ledger, config }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Classify `record` at `now` without touching the ledger.
    pub fn classify(&self, record: HeartbeatRecord, now: DateTime<Utc>) -> ReconciliationReport {
        let elapsed = now - record.last_heartbeat_at;
        let mut anomalies = Vec::new();

        if elapsed < Duration::zero() || elapsed > self.config.max_clock_drift {
            anomalies.push(Anomaly::ClockDrift {
                session_id: record.session_id.clone(),
                elapsed_secs: elapsed.num_seconds(),
            });
        }

        let outcome = match record.status {
            SessionStatus::Dismissed | SessionStatus::PunishmentDispatched => {
                ReconciliationOutcome::CleanlyClosed { record }
            }
            // Snoozed/Interrupted never reached PunishmentDispatched; the
            // dispatcher's marker keeps a second dispatch harmless.
            SessionStatus::Snoozed | SessionStatus::Interrupted => {
                anomalies.push(Anomaly::StaleHeartbeat {
                    session_id: record.session_id.clone(),
                    age_secs: elapsed.num_seconds(),
                });
                ReconciliationOutcome::Interrupted { record }
            }
            SessionStatus::Ringing | SessionStatus::ProofPending => {
                if elapsed > self.config.stale_threshold {
                    anomalies.push(Anomaly::StaleHeartbeat {
                        session_id: record.session_id.clone(),
                        age_secs: elapsed.num_seconds(),
                    });
                    ReconciliationOutcome::Interrupted { record }
                } else {
                    ReconciliationOutcome::StillActive { record }
                }
            }
        };

        ReconciliationReport {
            outcome,
            anomalies,
            checked_at: now,
        }
    }

    /// Read the ledger and classify it, deleting records that are settled
    /// or unreadable. Interrupted and still-active records are left for
    /// the caller, which clears them once the punishment is dispatched.
    pub fn check_on_startup(&self, now: DateTime<Utc>) -> Result<ReconciliationReport, StoreError> {
        let record = match self.ledger.read() {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!("no heartbeat record at startup");
                return Ok(ReconciliationReport::new(
                    ReconciliationOutcome::NoPriorSession,
                    now,
                ));
            }
            Err(StoreError::Corrupt { message, .. }) => {
                tracing::error!(error = %message, "heartbeat record unreadable, discarding");
                self.ledger.clear()?;
                let mut report =
                    ReconciliationReport::new(ReconciliationOutcome::NoPriorSession, now);
                report.anomalies.push(Anomaly::CorruptLedger { message });
                return Ok(report);
            }
            Err(e) => return Err(e),
        };

        let report = self.classify(record, now);

        for anomaly in &report.anomalies {
            match anomaly {
                Anomaly::ClockDrift {
                    session_id,
                    elapsed_secs,
                } => tracing::warn!(session_id = %session_id, elapsed_secs, "clock drift outside plausible range"),
                Anomaly::StaleHeartbeat {
                    session_id,
                    age_secs,
                } => tracing::warn!(session_id = %session_id, age_secs, "ringing session was interrupted"),
                Anomaly::CorruptLedger { .. } => {}
            }
        }

        match &report.outcome {
            ReconciliationOutcome::CleanlyClosed { record } => {
                tracing::info!(session_id = %record.session_id, "previous session closed cleanly");
                self.ledger.clear_session(&record.session_id)?;
            }
            ReconciliationOutcome::StillActive { record } => {
                tracing::info!(session_id = %record.session_id, "previous session still active");
            }
            _ => {}
        }

        Ok(report)
    }
}
