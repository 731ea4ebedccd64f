//! Startup reconciliation from the command line.
//!
//! Without `--apply` the ledger is classified and left untouched. With it,
//! a headless engine runs the real startup path, so an interrupted session
//! is punished and the record settled.

use std::sync::Arc;

use chrono::Utc;
use clap::Args;
use serde_json::json;
use wakeward_core::{
    AlarmEngine, EngineConfig, EnginePorts, HeartbeatLedger, MemoryDelivery, NullAudio,
    ProofContext, ProofVerifier, ReconcileConfig, ReconciliationChecker, ReconciliationOutcome,
    StoreError,
};

use super::{open_store, print_json, CliResult};

#[derive(Args)]
pub struct ReconcileArgs {
    /// Act on the outcome (dispatch punishment, settle the record)
    #[arg(long)]
    apply: bool,
}

/// The CLI cannot collect proof.
struct RejectAll;

impl ProofVerifier for RejectAll {
    fn verify(&self, _context: &ProofContext) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        Ok(false)
    }
}

pub fn run(args: ReconcileArgs) -> CliResult {
    let config = EngineConfig::load()?;
    let kv = open_store()?;
    let now = Utc::now();

    if !args.apply {
        let ledger = Arc::new(HeartbeatLedger::new(kv));
        let checker = ReconciliationChecker::new(
            ledger.clone(),
            ReconcileConfig {
                stale_threshold: config.stale_threshold(),
                max_clock_drift: config.max_clock_drift(),
            },
        );
        return match ledger.read() {
            Ok(Some(record)) => print_json(&checker.classify(record, now)),
            Ok(None) => print_json(&json!({
                "outcome": ReconciliationOutcome::NoPriorSession,
                "anomalies": [],
                "checked_at": now,
            })),
            Err(StoreError::Corrupt { message, .. }) => print_json(&json!({
                "outcome": "corrupt",
                "message": message,
                "checked_at": now,
            })),
            Err(e) => Err(e.into()),
        };
    }

    let ports = EnginePorts {
        delivery: Arc::new(MemoryDelivery::new()),
        verifier: Arc::new(RejectAll),
        audio: Arc::new(NullAudio),
        senders: Vec::new(),
    };
    let mut engine = AlarmEngine::new(kv, config, ports)?;
    let events = engine.startup(now)?;
    // Startup may have resumed a fresh session; this process cannot ring it.
    engine.dispose();
    print_json(&json!({
        "report": engine.startup_report(),
        "events": events,
    }))
}
