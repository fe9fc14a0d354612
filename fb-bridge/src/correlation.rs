//! Outbound remote message id to owning session, with bounded lifetime.

use crate::error::{BridgeError, Result};
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use fb_channels::MessageId;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationEntry {
    pub remote_message_id: MessageId,
    pub session_id: SessionId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct CorrelationStore {
    entries: Mutex<HashMap<MessageId, CorrelationEntry>>,
}

impl CorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &self,
        remote_message_id: MessageId,
        session_id: SessionId,
        ttl: Duration,
    ) -> Result<()> {
        self.record_at(remote_message_id, session_id, Utc::now(), ttl)
    }

    /// Insert a mapping. An id that is already tracked keeps its existing entry.
    pub fn record_at(
        &self,
        remote_message_id: MessageId,
        session_id: SessionId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<()> {
        let ttl =
            chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut entries = self.lock();
        if entries.contains_key(&remote_message_id) {
            return Err(BridgeError::DuplicateKey(remote_message_id));
        }
        entries.insert(
            remote_message_id.clone(),
            CorrelationEntry {
                remote_message_id,
                session_id,
                expires_at,
            },
        );
        Ok(())
    }

    /// Look up and consume the entry for `remote_message_id`. Unknown ids yield `None`.
    pub fn resolve(&self, remote_message_id: &MessageId) -> Option<SessionId> {
        self.lock()
            .remove(remote_message_id)
            .map(|entry| entry.session_id)
    }

    /// Drop every entry with `expires_at <= now` and return them.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<CorrelationEntry> {
        let mut entries = self.lock();
        let expired: Vec<MessageId> = entries
            .values()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.remote_message_id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .collect()
    }

    /// Drop all outstanding entries of one session. Returns how many were removed.
    pub fn remove_session(&self, session_id: &SessionId) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| &entry.session_id != session_id);
        before - entries.len()
    }

    pub fn has_session(&self, session_id: &SessionId) -> bool {
        self.lock()
            .values()
            .any(|entry| &entry.session_id == session_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MessageId, CorrelationEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::CorrelationStore;
    use crate::error::BridgeError;
    use crate::session::SessionId;
    use chrono::Utc;
    use fb_channels::MessageId;
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn resolve_consumes_entry_once() {
        let store = CorrelationStore::new();
        let session = SessionId::new("s1");
        store
            .record(MessageId::from(10), session.clone(), HOUR)
            .expect("record");

        assert_eq!(store.resolve(&MessageId::from(10)), Some(session));
        assert_eq!(store.resolve(&MessageId::from(10)), None);
        assert_eq!(store.resolve(&MessageId::from(99)), None);
        assert!(store.is_empty());
    }

    #[test]
    fn duplicate_id_keeps_first_entry() {
        let store = CorrelationStore::new();
        store
            .record(MessageId::from(1), SessionId::new("first"), HOUR)
            .expect("record");

        let err = store
            .record(MessageId::from(1), SessionId::new("second"), HOUR)
            .expect_err("duplicate");
        assert!(matches!(err, BridgeError::DuplicateKey(ref id) if id.as_str() == "1"));
        assert_eq!(
            store.resolve(&MessageId::from(1)),
            Some(SessionId::new("first"))
        );
    }

    #[test]
    fn entries_expire_at_their_deadline() {
        let store = CorrelationStore::new();
        let now = Utc::now();
        store
            .record_at(MessageId::from(5), SessionId::new("s"), now, Duration::from_secs(60))
            .expect("record");

        let before = now + chrono::Duration::seconds(59);
        assert!(store.sweep_expired(before).is_empty());
        assert_eq!(store.len(), 1);

        let at = now + chrono::Duration::seconds(60);
        let swept = store.sweep_expired(at);
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].session_id, SessionId::new("s"));
        assert_eq!(store.resolve(&MessageId::from(5)), None);
    }

    #[test]
    fn removing_a_session_leaves_others() {
        let store = CorrelationStore::new();
        let a = SessionId::new("a");
        let b = SessionId::new("b");
        for id in 1..=3 {
            store.record(MessageId::from(id), a.clone(), HOUR).expect("record a");
        }
        store.record(MessageId::from(4), b.clone(), HOUR).expect("record b");

        assert_eq!(store.remove_session(&a), 3);
        assert!(!store.has_session(&a));
        assert!(store.has_session(&b));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn huge_ttl_does_not_overflow() {
        let store = CorrelationStore::new();
        store
            .record(MessageId::from(1), SessionId::new("s"), Duration::MAX)
            .expect("record");
        assert!(store.sweep_expired(Utc::now()).is_empty());
    }
}
