//! Heartbeat ledger inspection.

use clap::Subcommand;
use wakeward_core::HeartbeatLedger;

use super::{open_store, print_json, CliResult};

#[derive(Subcommand)]
pub enum LedgerAction {
    /// Print the current heartbeat record (null when empty)
    Show,
    /// Delete the heartbeat record without punishment
    Clear {
        /// Also delete a record that is still ringing or awaiting proof
        #[arg(long)]
        force: bool,
    },
}

pub fn run(action: LedgerAction) -> CliResult {
    let ledger = HeartbeatLedger::new(open_store()?);
    match action {
        LedgerAction::Show => {
            print_json(&ledger.read()?)?;
        }
        LedgerAction::Clear { force } => {
            if let Some(record) = ledger.read()? {
                if record.status.is_live() && !force {
                    return Err(format!(
                        "session {} is still {:?}; pass --force to clear it",
                        record.session_id, record.status
                    )
                    .into());
                }
            }
            ledger.clear()?;
            tracing::warn!(force, "heartbeat ledger cleared by hand");
            println!("ledger cleared");
        }
    }
    Ok(())
}
