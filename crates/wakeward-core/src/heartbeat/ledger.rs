//! Single-slot durable liveness record for the ringing session.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::alarm::ProofContext;
use crate::error::StoreError;
use crate::session::{Session, SessionId, SessionStatus};
use crate::storage::KvStore;

pub(crate) const LEDGER_KEY: &str = "ledger/current";
const SETTLED_PREFIX: &str = "settled/";

/// Durable note that a session ended by dismissal or disarm, so a
/// redelivered wake for it never rings again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SettledMarker {
    fire_at: DateTime<Utc>,
    settled_at: DateTime<Utc>,
}

/// The only session state that survives process death.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub session_id: SessionId,
    pub alarm_id: String,
    #[serde(default)]
    pub label: String,
    pub proof_context: ProofContext,
    pub last_heartbeat_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub fire_at: DateTime<Utc>,
    #[serde(default)]
    pub snooze_count: u32,
}

/// Serialized access to the ledger slot.
///
/// Every operation holds one mutex for its read-modify-write, so a
/// heartbeat can never interleave with dismissal. `heartbeat` and
/// `set_status` only touch a live record with the same session id, which
/// keeps a late heartbeat from resurrecting a record that was cleared.
pub struct HeartbeatLedger {
    kv: Arc<dyn KvStore>,
    lock: Mutex<()>,
}

impl HeartbeatLedger {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.lock.lock().map_err(|_| StoreError::Poisoned)
    }

    fn load(&self) -> Result<Option<HeartbeatRecord>, StoreError> {
        match self.kv.get(LEDGER_KEY)? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: LEDGER_KEY.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn store(&self, record: &HeartbeatRecord) -> Result<(), StoreError> {
        let json = serde_json::to_string(record).map_err(|e| StoreError::QueryFailed(e.to_string()))?;
        self.kv.put(LEDGER_KEY, &json)
    }

    /// Write the initial record for a session that just started ringing.
    pub fn begin_session(
        &self,
        session: &Session,
        proof_context: ProofContext,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatRecord, StoreError> {
        let _guard = self.guard()?;
        if let Ok(Some(existing)) = self.load() {
            if existing.status.is_live() && existing.session_id != session.id {
                tracing::warn!(
                    previous = %existing.session_id,
                    next = %session.id,
                    "overwriting live heartbeat record of another session"
                );
            }
        }
        let record = HeartbeatRecord {
            session_id: session.id.clone(),
            alarm_id: session.alarm_id.clone(),
            label: session.label.clone(),
            proof_context,
            last_heartbeat_at: now,
            started_at: session.started_at,
            status: session.status,
            fire_at: session.fire_at,
            snooze_count: session.snooze_count,
        };
        self.store(&record)?;
        tracing::debug!(session_id = %record.session_id, "heartbeat ledger opened");
        Ok(record)
    }

    /// Refresh `last_heartbeat_at`. Returns false (and writes nothing) when
    /// the slot is empty, belongs to another session, or is already settled.
    pub fn heartbeat(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let _guard = self.guard()?;
        match self.load()? {
            Some(mut record) if record.session_id == *session_id && record.status.is_live() => {
                record.last_heartbeat_at = now;
                self.store(&record)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Move a live record to another status, refreshing the heartbeat.
    pub fn set_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let _guard = self.guard()?;
        match self.load()? {
            Some(mut record) if record.session_id == *session_id && record.status.is_live() => {
                record.status = status;
                record.last_heartbeat_at = now;
                self.store(&record)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Durably flag the session as dismissed. Must be issued before
    /// `clear`, so a crash in between reconciles as cleanly closed.
    pub fn mark_dismissed(&self, session_id: &SessionId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.set_status(session_id, SessionStatus::Dismissed, now)
    }

    /// Delete the slot unconditionally.
    pub fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.guard()?;
        self.kv.delete(LEDGER_KEY)
    }

    /// Delete the slot only if it belongs to `session_id`.
    pub fn clear_session(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        let _guard = self.guard()?;
        let owned = match self.load() {
            Ok(Some(record)) => record.session_id == *session_id,
            Ok(None) => false,
            // An undecodable record can't be attributed to anyone; drop it.
            Err(StoreError::Corrupt { .. }) => true,
            Err(e) => return Err(e),
        };
        if owned {
            self.kv.delete(LEDGER_KEY)?;
        }
        Ok(owned)
    }

    /// Delete the slot only if it belongs to `alarm_id`.
    pub fn clear_alarm(&self, alarm_id: &str) -> Result<bool, StoreError> {
        let _guard = self.guard()?;
        let owned = matches!(self.load()?, Some(record) if record.alarm_id == alarm_id);
        if owned {
            self.kv.delete(LEDGER_KEY)?;
        }
        Ok(owned)
    }

    pub fn read(&self) -> Result<Option<HeartbeatRecord>, StoreError> {
        let _guard = self.guard()?;
        self.load()
    }

    fn settled_key(session_id: &SessionId) -> String {
        format!("{SETTLED_PREFIX}{session_id}")
    }

    /// Record that `session_id` (fired at `fire_at`) is over.
    pub fn settle(
        &self,
        session_id: &SessionId,
        fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let marker = SettledMarker {
            fire_at,
            settled_at: now,
        };
        let json = serde_json::to_string(&marker).map_err(|e| StoreError::QueryFailed(e.to_string()))?;
        self.kv.put(&Self::settled_key(session_id), &json)
    }

    /// Whether a settled marker exists. An unreadable marker still counts.
    pub fn is_settled(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.kv.get(&Self::settled_key(session_id))?.is_some())
    }

    /// Drop markers of sessions that fired before `before`. Returns how
    /// many were removed.
    pub fn prune_settled(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut removed = 0;
        for (key, json) in self.kv.scan_prefix(SETTLED_PREFIX)? {
            let stale = serde_json::from_str::<SettledMarker>(&json)
                .map(|m| m.fire_at < before)
                .unwrap_or(true);
            if stale {
                self.kv.delete(&key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "pruned settled session markers");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap()
    }

    fn ledger() -> (HeartbeatLedger, Arc<Database>) {
        let db = Arc::new(Database::open_memory().unwrap());
        (HeartbeatLedger::new(db.clone()), db)
    }

    fn session() -> Session {
        Session::new("alarm-1", "Wake", t0(), t0(), 0)
    }

    fn proof(session: &Session) -> ProofContext {
        ProofContext::new(session.id.clone(), &session.alarm_id, None)
    }

    #[test]
    fn begin_then_heartbeat_overwrites_timestamp() {
        let (ledger, _) = ledger();
        let s = session();
        ledger.begin_session(&s, proof(&s), t0()).unwrap();

        assert!(ledger.heartbeat(&s.id, t0() + Duration::seconds(10)).unwrap());
        let record = ledger.read().unwrap().unwrap();
        assert_eq!(record.last_heartbeat_at, t0() + Duration::seconds(10));
        assert_eq!(record.status, SessionStatus::Ringing);
        assert_eq!(record.started_at, t0());
    }

    #[test]
    fn heartbeat_never_resurrects_cleared_record() {
        let (ledger, _) = ledger();
        let s = session();
        ledger.begin_session(&s, proof(&s), t0()).unwrap();
        ledger.mark_dismissed(&s.id, t0() + Duration::seconds(3)).unwrap();
        ledger.clear().unwrap();

        assert!(!ledger.heartbeat(&s.id, t0() + Duration::seconds(10)).unwrap());
        assert!(ledger.read().unwrap().is_none());
    }

    #[test]
    fn heartbeat_ignores_dismissed_record() {
        let (ledger, _) = ledger();
        let s = session();
        ledger.begin_session(&s, proof(&s), t0()).unwrap();
        ledger.mark_dismissed(&s.id, t0() + Duration::seconds(3)).unwrap();

        assert!(!ledger.heartbeat(&s.id, t0() + Duration::seconds(10)).unwrap());
        let record = ledger.read().unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Dismissed);
        assert_eq!(record.last_heartbeat_at, t0() + Duration::seconds(3));
    }

    #[test]
    fn heartbeat_for_other_session_is_ignored() {
        let (ledger, _) = ledger();
        let s = session();
        ledger.begin_session(&s, proof(&s), t0()).unwrap();
        assert!(!ledger.heartbeat(&SessionId::from("sess-other"), t0()).unwrap());
    }

    #[test]
    fn clear_session_only_removes_own_record() {
        let (ledger, _) = ledger();
        let s = session();
        ledger.begin_session(&s, proof(&s), t0()).unwrap();

        assert!(!ledger.clear_session(&SessionId::from("sess-other")).unwrap());
        assert!(ledger.read().unwrap().is_some());
        assert!(ledger.clear_session(&s.id).unwrap());
        assert!(ledger.read().unwrap().is_none());
    }

    #[test]
    fn clear_alarm_matches_alarm_id() {
        let (ledger, _) = ledger();
        let s = session();
        ledger.begin_session(&s, proof(&s), t0()).unwrap();
        assert!(!ledger.clear_alarm("alarm-2").unwrap());
        assert!(ledger.clear_alarm("alarm-1").unwrap());
    }

    #[test]
    fn corrupt_record_is_reported() {
        let (ledger, db) = ledger();
        db.put(LEDGER_KEY, "{not json").unwrap();
        assert!(matches!(ledger.read(), Err(StoreError::Corrupt { .. })));
        assert!(ledger.clear_session(&SessionId::from("anything")).unwrap());
        assert!(ledger.read().unwrap().is_none());
    }

    #[test]
    fn settled_markers_survive_clear_and_prune_by_fire_time() {
        let (ledger, _) = ledger();
        let s = session();
        ledger.begin_session(&s, proof(&s), t0()).unwrap();
        ledger.settle(&s.id, s.fire_at, t0() + Duration::minutes(1)).unwrap();
        ledger.clear().unwrap();
        assert!(ledger.is_settled(&s.id).unwrap());
        assert!(!ledger.is_settled(&SessionId::from("sess-other")).unwrap());

        assert_eq!(ledger.prune_settled(t0()).unwrap(), 0);
        assert_eq!(ledger.prune_settled(t0() + Duration::seconds(1)).unwrap(), 1);
        assert!(!ledger.is_settled(&s.id).unwrap());
    }
}
