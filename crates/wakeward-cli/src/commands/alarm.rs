//! Alarm management commands for CLI.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use clap::Subcommand;
use uuid::Uuid;
use wakeward_core::{
    AlarmSchedule, AlarmStore, ChannelConfig, ChannelKind, DaySet, EngineConfig, FireTime,
    ProofRequirement,
};

use super::{open_store, print_json, CliResult};

#[derive(Subcommand)]
pub enum AlarmAction {
    /// Create or replace an alarm
    Add {
        /// Label shown while ringing
        label: String,
        /// Alarm ID (default: random UUID)
        #[arg(long)]
        id: Option<String>,
        /// One-shot fire instant (RFC 3339)
        #[arg(long, conflicts_with = "time")]
        at: Option<DateTime<Utc>>,
        /// Wall-clock time of day (HH:MM)
        #[arg(long)]
        time: Option<String>,
        /// Repeat days: comma-separated (mon,tue,...), "weekdays" or "daily".
        /// Omit for a one-shot alarm at the next occurrence of --time.
        #[arg(long, requires = "time")]
        days: Option<String>,
        /// Proof requirement as JSON, e.g. '{"kind":"step_count","steps":30}'
        #[arg(long)]
        proof: Option<String>,
        /// Punishment channel as KIND=DESTINATION (repeatable)
        #[arg(long = "channel")]
        channels: Vec<String>,
        /// Stake in minor currency units
        #[arg(long, default_value = "0")]
        stake: u64,
        /// Snooze delay in minutes
        #[arg(long)]
        snooze_minutes: Option<u32>,
        /// Ring at full volume instead of escalating
        #[arg(long)]
        no_escalation: bool,
        /// Do not schedule a backup wake
        #[arg(long)]
        no_backup: bool,
        /// Store the alarm disabled
        #[arg(long)]
        disabled: bool,
    },
    /// List alarms
    List,
    /// Show alarm details
    Show {
        /// Alarm ID
        id: String,
    },
    /// Delete an alarm
    Remove {
        /// Alarm ID
        id: String,
    },
    /// Enable an alarm
    Enable {
        /// Alarm ID
        id: String,
    },
    /// Disable an alarm
    Disable {
        /// Alarm ID
        id: String,
    },
}

pub fn run(action: AlarmAction) -> CliResult {
    let config = EngineConfig::load()?;
    let store = AlarmStore::new(open_store()?, config.max_channels);
    let now = Utc::now();

    match action {
        AlarmAction::Add {
            label,
            id,
            at,
            time,
            days,
            proof,
            channels,
            stake,
            snooze_minutes,
            no_escalation,
            no_backup,
            disabled,
        } => {
            let fire_time = match (at, time) {
                (Some(at), _) => FireTime::At { at },
                (None, Some(time)) => FireTime::Daily {
                    time: parse_time(&time)?,
                    days: days.as_deref().map(parse_days).transpose()?.unwrap_or_default(),
                },
                (None, None) => return Err("either --at or --time is required".into()),
            };

            let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let mut alarm = AlarmSchedule::new(id, label, fire_time);
            alarm.enabled = !disabled;
            alarm.stake_amount = stake;
            alarm.snooze_minutes = snooze_minutes;
            alarm.escalation.enabled = !no_escalation;
            alarm.escalation.backup_wake = !no_backup;
            alarm.proof = proof
                .as_deref()
                .map(serde_json::from_str::<ProofRequirement>)
                .transpose()?;
            alarm.punishment.channels = channels
                .iter()
                .map(|spec| parse_channel(spec))
                .collect::<Result<_, _>>()?;

            let stored = store.put(&alarm, now)?;
            print_json(&stored)?;
        }
        AlarmAction::List => {
            print_json(&store.list()?)?;
        }
        AlarmAction::Show { id } => {
            print_json(&store.require(&id)?)?;
        }
        AlarmAction::Remove { id } => {
            let removed = store.delete(&id)?;
            if !removed {
                return Err(format!("alarm not found: {id}").into());
            }
            print_json(&serde_json::json!({ "id": id, "removed": true }))?;
        }
        AlarmAction::Enable { id } => {
            print_json(&store.set_enabled(&id, true, now)?)?;
        }
        AlarmAction::Disable { id } => {
            print_json(&store.set_enabled(&id, false, now)?)?;
        }
    }
    Ok(())
}

fn parse_time(value: &str) -> Result<NaiveTime, Box<dyn std::error::Error>> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|e| format!("invalid time '{value}': {e}").into())
}

fn parse_days(value: &str) -> Result<DaySet, Box<dyn std::error::Error>> {
    match value {
        "daily" => return Ok(DaySet::every_day()),
        "weekdays" => return Ok(DaySet::weekdays()),
        _ => {}
    }
    value
        .split(',')
        .map(|d| {
            d.trim()
                .parse::<Weekday>()
                .map_err(|_| -> Box<dyn std::error::Error> { format!("invalid day '{}'", d.trim()).into() })
        })
        .collect()
}

fn parse_channel(spec: &str) -> Result<ChannelConfig, Box<dyn std::error::Error>> {
    let (kind, destination) = spec.split_once('=').unwrap_or((spec, ""));
    Ok(ChannelConfig {
        kind: kind.trim().parse::<ChannelKind>()?,
        destination: destination.trim().to_string(),
        enabled: true,
    })
}
