//! Punishment dispatch.
//!
//! Fans a snoozed or interrupted session out to its configured consequence
//! channels, exactly once per session id.

pub mod channel;
pub mod dispatcher;

pub use channel::{
    ChannelConfig, ChannelKind, ChannelSender, PunishmentConfig, PunishmentContext,
    PunishmentReason,
};
pub use dispatcher::{ChannelOutcome, ChannelStatus, DispatchResult, PunishmentDispatcher};
