pub mod alarm;
pub mod config;
pub mod ledger;
pub mod next;
pub mod reconcile;

use std::sync::Arc;

use serde::Serialize;
use wakeward_core::{Database, KvStore};

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Open the on-disk store under the data directory.
pub fn open_store() -> Result<Arc<dyn KvStore>, Box<dyn std::error::Error>> {
    Ok(Arc::new(Database::open()?))
}

pub fn print_json<T: Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
