use chrono::Utc;
use serde::Serialize;
use wakeward_core::{AlarmStore, EngineConfig, SessionId};

use super::{open_store, print_json, CliResult};

#[derive(Serialize)]
struct NextFire {
    alarm_id: String,
    label: String,
    next_fire_at: Option<chrono::DateTime<Utc>>,
    session_id: Option<SessionId>,
}

pub fn run() -> CliResult {
    let config = EngineConfig::load()?;
    let store = AlarmStore::new(open_store()?, config.max_channels);
    let now = Utc::now();
    let tz = config.utc_offset();

    let mut upcoming: Vec<NextFire> = store
        .enabled()?
        .into_iter()
        .map(|alarm| {
            let next_fire_at = alarm.next_fire_after(now, tz);
            NextFire {
                session_id: next_fire_at.map(|at| SessionId::derive(&alarm.id, at)),
                alarm_id: alarm.id,
                label: alarm.label,
                next_fire_at,
            }
        })
        .collect();
    upcoming.sort_by_key(|n| (n.next_fire_at.is_none(), n.next_fire_at));

    print_json(&upcoming)
}
