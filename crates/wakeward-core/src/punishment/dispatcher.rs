//! Idempotent punishment dispatcher.
//!
//! A durable marker `dispatch/<session-id>` is claimed before any sender
//! runs, and the final per-channel outcome is written back under the same
//! key. A second dispatch for the same session returns the stored result
//! without invoking a single sender, whether it comes from the live snooze
//! path or from startup reconciliation.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::channel::{ChannelKind, ChannelSender, PunishmentConfig, PunishmentContext};
use crate::error::{CoreError, StoreError};
use crate::session::SessionId;
use crate::storage::KvStore;

const MARKER_PREFIX: &str = "dispatch/";

/// Outcome of one channel send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelStatus {
    Sent,
    Failed { reason: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub kind: ChannelKind,
    #[serde(flatten)]
    pub status: ChannelStatus,
}

/// Result of a dispatch, also the durable punishment record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchResult {
    pub session_id: SessionId,
    pub dispatched_at: DateTime<Utc>,
    /// True when this call found an earlier dispatch and sent nothing.
    #[serde(default)]
    pub already_dispatched: bool,
    /// False while the claim is written but senders have not finished.
    #[serde(default)]
    pub completed: bool,
    pub outcomes: Vec<ChannelOutcome>,
}

impl DispatchResult {
    fn claim(session_id: &SessionId, at: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.clone(),
            dispatched_at: at,
            already_dispatched: false,
            completed: false,
            outcomes: Vec::new(),
        }
    }

    /// Channels whose sender accepted the punishment.
    pub fn triggered(&self) -> Vec<ChannelKind> {
        self.outcomes
            .iter()
            .filter(|o| o.status == ChannelStatus::Sent)
            .map(|o| o.kind)
            .collect()
    }

    pub fn failed(&self) -> Vec<ChannelKind> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ChannelStatus::Failed { .. }))
            .map(|o| o.kind)
            .collect()
    }

    pub fn skipped(&self) -> Vec<ChannelKind> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ChannelStatus::Skipped { .. }))
            .map(|o| o.kind)
            .collect()
    }
}

/// Best-effort, exactly-once fan-out to the registered channel senders.
pub struct PunishmentDispatcher {
    kv: Arc<dyn KvStore>,
    senders: HashMap<ChannelKind, Arc<dyn ChannelSender>>,
    max_channels: usize,
    dispatched: Mutex<HashSet<SessionId>>,
}

impl PunishmentDispatcher {
    pub fn new(kv: Arc<dyn KvStore>, max_channels: usize) -> Self {
        Self {
            kv,
            senders: HashMap::new(),
            max_channels,
            dispatched: Mutex::new(HashSet::new()),
        }
    }

    /// Register the sender for its channel, replacing any previous one.
    pub fn register(&mut self, sender: Arc<dyn ChannelSender>) {
        self.senders.insert(sender.kind(), sender);
    }

    pub fn with_senders(
        kv: Arc<dyn KvStore>,
        max_channels: usize,
        senders: impl IntoIterator<Item = Arc<dyn ChannelSender>>,
    ) -> Self {
        let mut dispatcher = Self::new(kv, max_channels);
        for sender in senders {
            dispatcher.register(sender);
        }
        dispatcher
    }

    fn marker_key(session_id: &SessionId) -> String {
        format!("{MARKER_PREFIX}{session_id}")
    }

    /// Stored punishment record for a session, if any.
    pub fn record(&self, session_id: &SessionId) -> Result<Option<DispatchResult>, StoreError> {
        let key = Self::marker_key(session_id);
        match self.kv.get(&key)? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key,
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn is_dispatched(&self, session_id: &SessionId) -> bool {
        if self
            .dispatched
            .lock()
            .map(|set| set.contains(session_id))
            .unwrap_or(false)
        {
            return true;
        }
        // An unreadable marker still counts as dispatched.
        !matches!(self.record(session_id), Ok(None))
    }

    /// Dispatch punishment for `session_id`.
    ///
    /// Re-invocation for the same session is a no-op success that returns
    /// the earlier record with `already_dispatched` set.
    pub fn dispatch(
        &self,
        session_id: &SessionId,
        config: &PunishmentConfig,
        context: &PunishmentContext,
    ) -> Result<DispatchResult, CoreError> {
        let mut dispatched = self.dispatched.lock().map_err(|_| CoreError::Dispatch {
            session_id: session_id.clone(),
            message: "dispatch lock poisoned".into(),
        })?;

        if dispatched.contains(session_id) {
            return Ok(self.previous_result(session_id, context.occurred_at));
        }

        match self.record(session_id) {
            Ok(Some(mut previous)) => {
                dispatched.insert(session_id.clone());
                tracing::info!(session_id = %session_id, "punishment already dispatched, skipping");
                previous.already_dispatched = true;
                return Ok(previous);
            }
            Ok(None) => {}
            Err(e) => {
                // Something is stored under the marker; treat the claim as taken.
                dispatched.insert(session_id.clone());
                tracing::warn!(session_id = %session_id, error = %e, "unreadable dispatch marker, treating as dispatched");
                let mut previous = DispatchResult::claim(session_id, context.occurred_at);
                previous.already_dispatched = true;
                return Ok(previous);
            }
        }

        dispatched.insert(session_id.clone());
        let mut result = DispatchResult::claim(session_id, context.occurred_at);
        if let Err(e) = self.write_record(&result) {
            // Without a durable claim a crash could repeat the sends; a missed
            // punishment is the worse outcome, so proceed.
            tracing::error!(session_id = %session_id, error = %e, "failed to persist dispatch claim");
        }

        let mut enabled: Vec<_> = config.enabled_channels().collect();
        if enabled.len() > self.max_channels {
            tracing::warn!(
                session_id = %session_id,
                enabled = enabled.len(),
                max = self.max_channels,
                "punishment config exceeds channel cap, truncating"
            );
            for extra in enabled.split_off(self.max_channels) {
                result.outcomes.push(ChannelOutcome {
                    kind: extra.kind,
                    status: ChannelStatus::Skipped {
                        reason: format!("exceeds cap of {} channels", self.max_channels),
                    },
                });
            }
        }

        for channel in enabled {
            let status = match self.senders.get(&channel.kind) {
                None => ChannelStatus::Skipped {
                    reason: "no sender registered".into(),
                },
                Some(sender) => match sender.send(&channel.destination, context) {
                    Ok(()) => ChannelStatus::Sent,
                    Err(e) => {
                        tracing::warn!(
                            session_id = %session_id,
                            channel = channel.kind.as_str(),
                            error = %e,
                            "punishment channel failed"
                        );
                        ChannelStatus::Failed {
                            reason: e.to_string(),
                        }
                    }
                },
            };
            result.outcomes.push(ChannelOutcome {
                kind: channel.kind,
                status,
            });
        }

        result.completed = true;
        if let Err(e) = self.write_record(&result) {
            tracing::error!(session_id = %session_id, error = %e, "failed to persist dispatch result");
        }

        tracing::info!(
            session_id = %session_id,
            reason = ?context.reason,
            sent = result.triggered().len(),
            failed = result.failed().len(),
            "punishment dispatched"
        );
        Ok(result)
    }

    fn previous_result(&self, session_id: &SessionId, at: DateTime<Utc>) -> DispatchResult {
        let mut previous = self
            .record(session_id)
            .ok()
            .flatten()
            .unwrap_or_else(|| DispatchResult::claim(session_id, at));
        previous.already_dispatched = true;
        previous
    }

    fn write_record(&self, result: &DispatchResult) -> Result<(), CoreError> {
        let json = serde_json::to_string(result)?;
        self.kv.put(&Self::marker_key(&result.session_id), &json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::punishment::channel::{ChannelConfig, PunishmentReason};
    use crate::storage::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSender {
        kind: ChannelKind,
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingSender {
        fn new(kind: ChannelKind, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl ChannelSender for CountingSender {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        fn send(
            &self,
            _destination: &str,
            _context: &PunishmentContext,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err("service unavailable".into())
            } else {
                Ok(())
            }
        }
    }

    fn config(kinds: &[ChannelKind]) -> PunishmentConfig {
        PunishmentConfig {
            channels: kinds
                .iter()
                .map(|&kind| ChannelConfig {
                    kind,
                    destination: "friend".into(),
                    enabled: true,
                })
                .collect(),
        }
    }

    fn context(session_id: &SessionId) -> PunishmentContext {
        PunishmentContext {
            session_id: session_id.clone(),
            alarm_id: "alarm-1".into(),
            label: "Gym".into(),
            reason: PunishmentReason::Snoozed,
            stake_amount: 500,
            snooze_count: 0,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn second_dispatch_sends_nothing() {
        let kv: Arc<dyn KvStore> = Arc::new(Database::open_memory().unwrap());
        let buddy = CountingSender::new(ChannelKind::BuddyNotify, false);
        let dispatcher = PunishmentDispatcher::with_senders(kv, 4, [buddy.clone() as Arc<dyn ChannelSender>]);
        let sid = SessionId::from("sess-1");
        let cfg = config(&[ChannelKind::BuddyNotify]);

        let first = dispatcher.dispatch(&sid, &cfg, &context(&sid)).unwrap();
        let second = dispatcher.dispatch(&sid, &cfg, &context(&sid)).unwrap();

        assert_eq!(buddy.calls.load(Ordering::SeqCst), 1);
        assert!(!first.already_dispatched);
        assert!(second.already_dispatched);
        assert_eq!(second.triggered(), vec![ChannelKind::BuddyNotify]);
    }

    #[test]
    fn marker_survives_a_new_dispatcher_instance() {
        let kv: Arc<dyn KvStore> = Arc::new(Database::open_memory().unwrap());
        let buddy = CountingSender::new(ChannelKind::BuddyNotify, false);
        let sid = SessionId::from("sess-restart");
        let cfg = config(&[ChannelKind::BuddyNotify]);

        let before_restart =
            PunishmentDispatcher::with_senders(kv.clone(), 4, [buddy.clone() as Arc<dyn ChannelSender>]);
        before_restart.dispatch(&sid, &cfg, &context(&sid)).unwrap();

        let after_restart =
            PunishmentDispatcher::with_senders(kv, 4, [buddy.clone() as Arc<dyn ChannelSender>]);
        assert!(after_restart.is_dispatched(&sid));
        let again = after_restart.dispatch(&sid, &cfg, &context(&sid)).unwrap();

        assert!(again.already_dispatched);
        assert_eq!(buddy.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_channel_does_not_block_others() {
        let kv: Arc<dyn KvStore> = Arc::new(Database::open_memory().unwrap());
        let money = CountingSender::new(ChannelKind::MoneyTransferRequest, true);
        let buddy = CountingSender::new(ChannelKind::BuddyNotify, false);
        let dispatcher = PunishmentDispatcher::with_senders(
            kv,
            4,
            [money.clone() as Arc<dyn ChannelSender>, buddy.clone() as Arc<dyn ChannelSender>],
        );
        let sid = SessionId::from("sess-2");
        let cfg = config(&[ChannelKind::MoneyTransferRequest, ChannelKind::BuddyNotify]);

        let result = dispatcher.dispatch(&sid, &cfg, &context(&sid)).unwrap();

        assert_eq!(result.failed(), vec![ChannelKind::MoneyTransferRequest]);
        assert_eq!(result.triggered(), vec![ChannelKind::BuddyNotify]);
        assert_eq!(buddy.calls.load(Ordering::SeqCst), 1);
        assert!(result.completed);
    }

    #[test]
    fn oversized_config_is_truncated_not_rejected() {
        let kv: Arc<dyn KvStore> = Arc::new(Database::open_memory().unwrap());
        let all = [
            ChannelKind::MoneyTransferRequest,
            ChannelKind::ShameVideoPlayback,
            ChannelKind::BuddyNotify,
            ChannelKind::SocialShameBroadcast,
            ChannelKind::AntiCharityDonation,
        ];
        let senders: Vec<Arc<dyn ChannelSender>> = all
            .iter()
            .map(|&k| CountingSender::new(k, false) as Arc<dyn ChannelSender>)
            .collect();
        let dispatcher = PunishmentDispatcher::with_senders(kv, 4, senders);
        let sid = SessionId::from("sess-3");

        let result = dispatcher.dispatch(&sid, &config(&all), &context(&sid)).unwrap();

        assert_eq!(result.triggered().len(), 4);
        assert_eq!(result.skipped(), vec![ChannelKind::AntiCharityDonation]);
    }

    #[test]
    fn unregistered_channel_is_skipped() {
        let kv: Arc<dyn KvStore> = Arc::new(Database::open_memory().unwrap());
        let dispatcher = PunishmentDispatcher::new(kv, 4);
        let sid = SessionId::from("sess-4");

        let result = dispatcher
            .dispatch(&sid, &config(&[ChannelKind::ShameVideoPlayback]), &context(&sid))
            .unwrap();

        assert!(result.triggered().is_empty());
        assert_eq!(result.skipped(), vec![ChannelKind::ShameVideoPlayback]);
    }
}
