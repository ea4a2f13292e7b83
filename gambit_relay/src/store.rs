// Session store: the durable record collaborator.
//
// The relay needs four operations: create, fetch-by-id, persist-after-
// mutation, and query-by-participant/status. `SessionStore` is the seam; the
// standalone relay and the tests run on `MemoryStore`. A deployment backed
// by a real database implements this trait and passes it to
// `start_relay_with`.
//
// Store failures are never fatal to a session: the engine logs, abandons
// the single affected entry, and keeps draining (a stuck session with no
// terminal state is worse than one dropped update, since the next
// successful move resynchronizes every client).

use std::collections::HashMap;

use thiserror::Error;

use gambit_protocol::record::SessionRecord;
use gambit_protocol::types::{SessionId, SessionStatus, UserId};

/// Failure of a single store operation.
#[derive(Debug, Error)]
#[error("session store: {0}")]
pub struct StoreError(pub String);

/// Durable session records, keyed by id.
pub trait SessionStore: Send {
    fn create(&mut self, record: SessionRecord) -> Result<(), StoreError>;
    fn fetch(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError>;
    fn persist(&mut self, record: &SessionRecord) -> Result<(), StoreError>;
    fn delete(&mut self, id: &SessionId) -> Result<(), StoreError>;
    /// Sessions where the identity occupies a seat, optionally filtered by
    /// status, oldest first.
    fn find_for_user(
        &self,
        user: &UserId,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionRecord>, StoreError>;

    /// The session a reconnecting participant should be reattached to.
    fn find_active_for_user(&self, user: &UserId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self
            .find_for_user(user, Some(SessionStatus::Active))?
            .into_iter()
            .next())
    }
}

/// In-memory store used by the standalone relay and tests.
#[derive(Default)]
pub struct MemoryStore {
    sessions: HashMap<SessionId, SessionRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for MemoryStore {
    fn create(&mut self, record: SessionRecord) -> Result<(), StoreError> {
        if self.sessions.contains_key(&record.id) {
            return Err(StoreError(format!("duplicate session id {:?}", record.id.0)));
        }
        self.sessions.insert(record.id.clone(), record);
        Ok(())
    }

    fn fetch(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.get(id).cloned())
    }

    fn persist(&mut self, record: &SessionRecord) -> Result<(), StoreError> {
        self.sessions.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn delete(&mut self, id: &SessionId) -> Result<(), StoreError> {
        self.sessions.remove(id);
        Ok(())
    }

    fn find_for_user(
        &self,
        user: &UserId,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        let mut found: Vec<SessionRecord> = self
            .sessions
            .values()
            .filter(|r| r.role_of(user).is_some())
            .filter(|r| status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(found)
    }
}

/// Store wrapper that fails the next N persist calls. Exercises the
/// log-and-continue failure mode.
#[cfg(test)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub failing_persists: usize,
}

#[cfg(test)]
impl SessionStore for FlakyStore {
    fn create(&mut self, record: SessionRecord) -> Result<(), StoreError> {
        self.inner.create(record)
    }

    fn fetch(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.inner.fetch(id)
    }

    fn persist(&mut self, record: &SessionRecord) -> Result<(), StoreError> {
        if self.failing_persists > 0 {
            self.failing_persists -= 1;
            return Err(StoreError("store unavailable".into()));
        }
        self.inner.persist(record)
    }

    fn delete(&mut self, id: &SessionId) -> Result<(), StoreError> {
        self.inner.delete(id)
    }

    fn find_for_user(
        &self,
        user: &UserId,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionRecord>, StoreError> {
        self.inner.find_for_user(user, status)
    }
}
