use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::proof::ProofRequirement;
use crate::error::ValidationError;
use crate::escalation::EscalationParams;
use crate::punishment::PunishmentConfig;
use crate::storage::EscalationDefaults;

/// Set of weekdays an alarm repeats on, stored as a Monday-first bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Weekday>", into = "Vec<Weekday>")]
pub struct DaySet(u8);

impl DaySet {
    pub const EMPTY: DaySet = DaySet(0);

    pub fn every_day() -> Self {
        DaySet(0b111_1111)
    }

    pub fn weekdays() -> Self {
        DaySet(0b001_1111)
    }

    pub fn insert(&mut self, day: Weekday) {
        self.0 |= 1 << day.num_days_from_monday();
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Weekday> + '_ {
        [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ]
        .into_iter()
        .filter(|d| self.contains(*d))
    }
}

impl FromIterator<Weekday> for DaySet {
    fn from_iter<I: IntoIterator<Item = Weekday>>(iter: I) -> Self {
        let mut set = DaySet::EMPTY;
        for day in iter {
            set.insert(day);
        }
        set
    }
}

impl From<Vec<Weekday>> for DaySet {
    fn from(days: Vec<Weekday>) -> Self {
        days.into_iter().collect()
    }
}

impl From<DaySet> for Vec<Weekday> {
    fn from(set: DaySet) -> Self {
        set.iter().collect()
    }
}

/// When an alarm fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FireTime {
    /// One-shot at an absolute instant.
    At { at: DateTime<Utc> },
    /// Wall-clock time of day on the selected days. An empty day set
    /// fires once, at the next occurrence of `time`.
    Daily {
        time: NaiveTime,
        #[serde(default)]
        days: DaySet,
    },
}

impl FireTime {
    pub fn is_one_shot(&self) -> bool {
        match self {
            FireTime::At { .. } => true,
            FireTime::Daily { days, .. } => days.is_empty(),
        }
    }

    /// Smallest fire instant strictly after `now`, evaluating wall-clock
    /// times in `tz`. `None` for an absolute instant that has passed.
    pub fn next_after(&self, now: DateTime<Utc>, tz: FixedOffset) -> Option<DateTime<Utc>> {
        match self {
            FireTime::At { at } => (*at > now).then_some(*at),
            FireTime::Daily { time, days } => {
                let today = now.with_timezone(&tz).date_naive();
                // Eight days so that "today, but earlier than now" wraps to next week.
                (0..=7).find_map(|offset| {
                    let date = today + Duration::days(offset);
                    if !days.is_empty() && !days.contains(date.weekday()) {
                        return None;
                    }
                    let candidate = tz
                        .from_local_datetime(&date.and_time(*time))
                        .single()?
                        .with_timezone(&Utc);
                    (candidate > now).then_some(candidate)
                })
            }
        }
    }
}

/// Per-alarm escalation flags; unset values fall back to the engine defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationFlags {
    /// When false the alarm rings at full volume from the start.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Schedule a fallback OS wake after the primary one.
    #[serde(default = "default_true")]
    pub backup_wake: bool,
    #[serde(default)]
    pub base_volume: Option<f64>,
    #[serde(default)]
    pub max_volume: Option<f64>,
    #[serde(default)]
    pub step_amount: Option<f64>,
    #[serde(default)]
    pub step_interval_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl Default for EscalationFlags {
    fn default() -> Self {
        Self {
            enabled: true,
            backup_wake: true,
            base_volume: None,
            max_volume: None,
            step_amount: None,
            step_interval_secs: None,
        }
    }
}

impl EscalationFlags {
    pub fn params(&self, defaults: &EscalationDefaults) -> EscalationParams {
        let max_volume = self.max_volume.unwrap_or(defaults.max_volume).clamp(0.0, 1.0);
        if !self.enabled {
            return EscalationParams {
                base_volume: max_volume,
                max_volume,
                step_amount: 0.0,
                step_interval: step_interval(defaults.step_interval_secs),
            };
        }
        EscalationParams {
            base_volume: self
                .base_volume
                .unwrap_or(defaults.base_volume)
                .clamp(0.0, max_volume),
            max_volume,
            step_amount: Some(self.step_amount.unwrap_or(defaults.step_amount))
                .filter(|a| a.is_finite() && *a >= 0.0)
                .unwrap_or(0.0),
            step_interval: step_interval(self.step_interval_secs.unwrap_or(defaults.step_interval_secs)),
        }
    }
}

/// Longest accepted escalation step.
pub const MAX_STEP_INTERVAL_SECS: u64 = 3600;

fn step_interval(secs: u64) -> Duration {
    Duration::seconds(secs.clamp(1, MAX_STEP_INTERVAL_SECS) as i64)
}

/// A user-configured alarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmSchedule {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub fire_time: FireTime,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// `None` means the user only has to confirm.
    #[serde(default)]
    pub proof: Option<ProofRequirement>,
    #[serde(default)]
    pub punishment: PunishmentConfig,
    #[serde(default)]
    pub escalation: EscalationFlags,
    /// Stake in minor currency units.
    #[serde(default)]
    pub stake_amount: u64,
    /// Per-alarm snooze delay; engine default when unset.
    #[serde(default)]
    pub snooze_minutes: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlarmSchedule {
    pub fn new(id: impl Into<String>, label: impl Into<String>, fire_time: FireTime) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            label: label.into(),
            fire_time,
            enabled: true,
            proof: None,
            punishment: PunishmentConfig::default(),
            escalation: EscalationFlags::default(),
            stake_amount: 0,
            snooze_minutes: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn next_fire_after(&self, now: DateTime<Utc>, tz: FixedOffset) -> Option<DateTime<Utc>> {
        self.fire_time.next_after(now, tz)
    }

    /// Configuration-time checks run by the alarm store on every write.
    pub fn validate(&self, max_channels: usize, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::InvalidValue {
                field: "id".into(),
                message: "must not be empty".into(),
            });
        }
        self.punishment.validate(max_channels)?;

        if let FireTime::At { at } = self.fire_time {
            if self.enabled && at <= now {
                return Err(ValidationError::FireTimeInPast { at, now });
            }
        }

        let volumes = [
            ("escalation.base_volume", self.escalation.base_volume),
            ("escalation.max_volume", self.escalation.max_volume),
        ];
        for (field, value) in volumes {
            if let Some(v) = value {
                if !(0.0..=1.0).contains(&v) {
                    return Err(ValidationError::InvalidValue {
                        field: field.into(),
                        message: format!("{v} is outside 0.0..=1.0"),
                    });
                }
            }
        }
        if let Some(secs) = self.escalation.step_interval_secs {
            if !(1..=MAX_STEP_INTERVAL_SECS).contains(&secs) {
                return Err(ValidationError::InvalidValue {
                    field: "escalation.step_interval_secs".into(),
                    message: format!("{secs} is outside 1..={MAX_STEP_INTERVAL_SECS}"),
                });
            }
        }
        if let Some(amount) = self.escalation.step_amount {
            if !amount.is_finite() || amount < 0.0 {
                return Err(ValidationError::InvalidValue {
                    field: "escalation.step_amount".into(),
                    message: format!("{amount} must be a finite, non-negative number"),
                });
            }
        }
        if matches!(self.snooze_minutes, Some(0)) {
            return Err(ValidationError::InvalidValue {
                field: "snooze_minutes".into(),
                message: "must be at least one minute".into(),
            });
        }
        Ok(())
    }
}
