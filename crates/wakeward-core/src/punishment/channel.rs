//! Punishment channel definitions and the sender port.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::session::SessionId;

/// Consequence channels an alarm can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    MoneyTransferRequest,
    ShameVideoPlayback,
    BuddyNotify,
    SocialShameBroadcast,
    AntiCharityDonation,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::MoneyTransferRequest => "money_transfer_request",
            ChannelKind::ShameVideoPlayback => "shame_video_playback",
            ChannelKind::BuddyNotify => "buddy_notify",
            ChannelKind::SocialShameBroadcast => "social_shame_broadcast",
            ChannelKind::AntiCharityDonation => "anti_charity_donation",
        }
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "money_transfer_request" | "money" => Ok(ChannelKind::MoneyTransferRequest),
            "shame_video_playback" | "shame_video" => Ok(ChannelKind::ShameVideoPlayback),
            "buddy_notify" | "buddy" => Ok(ChannelKind::BuddyNotify),
            "social_shame_broadcast" | "social" => Ok(ChannelKind::SocialShameBroadcast),
            "anti_charity_donation" | "anti_charity" => Ok(ChannelKind::AntiCharityDonation),
            other => Err(ValidationError::InvalidValue {
                field: "channel".into(),
                message: format!("unknown punishment channel '{other}'"),
            }),
        }
    }
}

/// One configured channel with its destination (phone number, handle,
/// payment address, media id, ...). Interpretation is up to the sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    #[serde(default)]
    pub destination: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PunishmentConfig {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl PunishmentConfig {
    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }

    pub fn is_empty(&self) -> bool {
        self.enabled_channels().next().is_none()
    }

    /// Configuration-time check: no duplicate kinds, at most `max` enabled.
    pub fn validate(&self, max: usize) -> Result<(), ValidationError> {
        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.kind) {
                return Err(ValidationError::InvalidValue {
                    field: "punishment.channels".into(),
                    message: format!("channel {} configured twice", channel.kind.as_str()),
                });
            }
        }
        let enabled = self.enabled_channels().count();
        if enabled > max {
            return Err(ValidationError::TooManyChannels { max, got: enabled });
        }
        Ok(())
    }
}

/// Why a punishment is being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunishmentReason {
    Snoozed,
    Interrupted,
}

/// Everything a sender gets to build its message or request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PunishmentContext {
    pub session_id: SessionId,
    pub alarm_id: String,
    pub label: String,
    pub reason: PunishmentReason,
    /// Stake in minor currency units.
    pub stake_amount: u64,
    pub snooze_count: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Outbound hand-off for one channel (payment app, messenger, media player).
///
/// Senders are invoked at most once per session and never retried.
pub trait ChannelSender: Send + Sync {
    fn kind(&self) -> ChannelKind;

    fn send(
        &self,
        destination: &str,
        context: &PunishmentContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(kind: ChannelKind, enabled: bool) -> ChannelConfig {
        ChannelConfig {
            kind,
            destination: "dest".into(),
            enabled,
        }
    }

    #[test]
    fn validate_counts_only_enabled_channels() {
        let cfg = PunishmentConfig {
            channels: vec![
                channel(ChannelKind::MoneyTransferRequest, true),
                channel(ChannelKind::ShameVideoPlayback, true),
                channel(ChannelKind::BuddyNotify, true),
                channel(ChannelKind::SocialShameBroadcast, true),
                channel(ChannelKind::AntiCharityDonation, false),
            ],
        };
        assert!(cfg.validate(4).is_ok());
    }

    #[test]
    fn validate_rejects_five_enabled() {
        let cfg = PunishmentConfig {
            channels: vec![
                channel(ChannelKind::MoneyTransferRequest, true),
                channel(ChannelKind::ShameVideoPlayback, true),
                channel(ChannelKind::BuddyNotify, true),
                channel(ChannelKind::SocialShameBroadcast, true),
                channel(ChannelKind::AntiCharityDonation, true),
            ],
        };
        assert!(matches!(
            cfg.validate(4),
            Err(ValidationError::TooManyChannels { max: 4, got: 5 })
        ));
    }

    #[test]
    fn validate_rejects_duplicates() {
        let cfg = PunishmentConfig {
            channels: vec![
                channel(ChannelKind::BuddyNotify, true),
                channel(ChannelKind::BuddyNotify, false),
            ],
        };
        assert!(cfg.validate(4).is_err());
    }

    #[test]
    fn channel_kind_parses_short_names() {
        assert_eq!("buddy".parse::<ChannelKind>().unwrap(), ChannelKind::BuddyNotify);
        assert_eq!(
            "anti_charity_donation".parse::<ChannelKind>().unwrap(),
            ChannelKind::AntiCharityDonation
        );
        assert!("carrier_pigeon".parse::<ChannelKind>().is_err());
    }
}
