//! Heartbeat ledger and startup reconciliation.
//!
//! While a session is ringing the engine periodically overwrites a single
//! durable record with the current time. On the next process start the
//! reconciliation checker looks at how old that record is to tell a clean
//! shutdown from a killed app.

mod ledger;
mod reconcile;

pub use ledger::{HeartbeatLedger, HeartbeatRecord};
pub use reconcile::{
    Anomaly, ReconcileConfig, ReconciliationChecker, ReconciliationOutcome, ReconciliationReport,
};
