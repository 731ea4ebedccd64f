use clap::Subcommand;
use wakeward_core::EngineConfig;

use super::{print_json, CliResult};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a config value
    Get {
        /// Dot-separated key (e.g. "stale_threshold_secs", "escalation.base_volume")
        key: String,
    },
    /// Set a config value
    Set {
        /// Config key
        key: String,
        /// New value
        value: String,
    },
    /// Print the whole config
    Show,
    /// Print the config file path
    Path,
    /// Reset config to defaults
    Reset,
}

pub fn run(action: ConfigAction) -> CliResult {
    match action {
        ConfigAction::Get { key } => {
            let config = EngineConfig::load()?;
            match config.get(&key) {
                Some(value) => println!("{value}"),
                None => return Err(format!("unknown key: {key}").into()),
            }
        }
        ConfigAction::Set { key, value } => {
            let mut config = EngineConfig::load()?;
            config.set(&key, &value)?;
            config.save()?;
            println!("ok");
        }
        ConfigAction::Show => {
            print_json(&EngineConfig::load()?)?;
        }
        ConfigAction::Path => {
            println!("{}", EngineConfig::path()?.display());
        }
        ConfigAction::Reset => {
            EngineConfig::default().save()?;
            println!("config reset to defaults");
        }
    }
    Ok(())
}
