//! Durable alarm-id -> AlarmSchedule mapping.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::schedule::AlarmSchedule;
use crate::error::{CoreError, StoreError};
use crate::storage::KvStore;

const ALARM_PREFIX: &str = "alarm/";

pub struct AlarmStore {
    kv: Arc<dyn KvStore>,
    max_channels: usize,
}

impl AlarmStore {
    pub fn new(kv: Arc<dyn KvStore>, max_channels: usize) -> Self {
        Self { kv, max_channels }
    }

    fn key(id: &str) -> String {
        format!("{ALARM_PREFIX}{id}")
    }

    fn decode(key: &str, json: &str) -> Result<AlarmSchedule, StoreError> {
        serde_json::from_str(json).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Validate and upsert. `updated_at` is stamped with `now`.
    pub fn put(&self, schedule: &AlarmSchedule, now: DateTime<Utc>) -> Result<AlarmSchedule, CoreError> {
        schedule.validate(self.max_channels, now)?;
        let mut stored = schedule.clone();
        stored.updated_at = now;
        if let Some(existing) = self.get(&schedule.id)? {
            stored.created_at = existing.created_at;
        }
        let json = serde_json::to_string(&stored)?;
        self.kv.put(&Self::key(&stored.id), &json)?;
        tracing::debug!(alarm_id = %stored.id, enabled = stored.enabled, "alarm saved");
        Ok(stored)
    }

    pub fn get(&self, id: &str) -> Result<Option<AlarmSchedule>, StoreError> {
        let key = Self::key(id);
        match self.kv.get(&key)? {
            Some(json) => Self::decode(&key, &json).map(Some),
            None => Ok(None),
        }
    }

    pub fn require(&self, id: &str) -> Result<AlarmSchedule, CoreError> {
        self.get(id)?
            .ok_or_else(|| CoreError::UnknownAlarm(id.to_string()))
    }

    /// All alarms ordered by id. Undecodable entries are logged and skipped.
    pub fn list(&self) -> Result<Vec<AlarmSchedule>, StoreError> {
        let mut alarms = Vec::new();
        for (key, json) in self.kv.scan_prefix(ALARM_PREFIX)? {
            match Self::decode(&key, &json) {
                Ok(alarm) => alarms.push(alarm),
                Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable alarm"),
            }
        }
        Ok(alarms)
    }

    pub fn enabled(&self) -> Result<Vec<AlarmSchedule>, StoreError> {
        Ok(self.list()?.into_iter().filter(|a| a.enabled).collect())
    }

    /// Returns false when the alarm did not exist.
    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let existed = self.get(id)?.is_some();
        self.kv.delete(&Self::key(id))?;
        Ok(existed)
    }

    /// Flip the enabled flag without re-validating the fire time, so a
    /// one-shot alarm can be disabled after it fired.
    pub fn set_enabled(&self, id: &str, enabled: bool, now: DateTime<Utc>) -> Result<AlarmSchedule, CoreError> {
        let mut alarm = self.require(id)?;
        alarm.enabled = enabled;
        alarm.updated_at = now;
        let json = serde_json::to_string(&alarm)?;
        self.kv.put(&Self::key(id), &json)?;
        Ok(alarm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::schedule::{DaySet, FireTime};
    use crate::error::ValidationError;
    use crate::storage::Database;
    use chrono::{Duration, NaiveTime};

    fn store() -> AlarmStore {
        AlarmStore::new(Arc::new(Database::open_memory().unwrap()), 4)
    }

    fn daily(id: &str) -> AlarmSchedule {
        AlarmSchedule::new(
            id,
            "Wake up",
            FireTime::Daily {
                time: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                days: DaySet::weekdays(),
            },
        )
    }

    #[test]
    fn put_get_list_delete() {
        let store = store();
        let now = Utc::now();
        store.put(&daily("b"), now).unwrap();
        store.put(&daily("a"), now).unwrap();

        assert_eq!(store.get("a").unwrap().unwrap().label, "Wake up");
        let ids: Vec<_> = store.list().unwrap().into_iter().map(|a| a.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn update_keeps_created_at() {
        let store = store();
        let first = Utc::now();
        let saved = store.put(&daily("a"), first).unwrap();

        let mut edited = saved.clone();
        edited.label = "Gym".into();
        edited.created_at = first + Duration::days(3);
        let later = first + Duration::hours(1);
        let updated = store.put(&edited, later).unwrap();

        assert_eq!(updated.created_at, saved.created_at);
        assert_eq!(updated.updated_at, later);
    }

    #[test]
    fn put_rejects_invalid_schedule() {
        let store = store();
        let now = Utc::now();
        let past = AlarmSchedule::new("p", "Past", FireTime::At { at: now - Duration::minutes(1) });
        assert!(matches!(
            store.put(&past, now),
            Err(CoreError::Validation(ValidationError::FireTimeInPast { .. }))
        ));
    }

    #[test]
    fn set_enabled_allows_disabling_past_one_shot() {
        let store = store();
        let now = Utc::now();
        let nap = AlarmSchedule::new("n", "Nap", FireTime::At { at: now + Duration::minutes(5) });
        store.put(&nap, now).unwrap();

        let later = now + Duration::minutes(10);
        let disabled = store.set_enabled("n", false, later).unwrap();
        assert!(!disabled.enabled);
        assert!(store.enabled().unwrap().is_empty());
    }

    #[test]
    fn require_unknown_alarm() {
        assert!(matches!(store().require("ghost"), Err(CoreError::UnknownAlarm(_))));
    }
}
