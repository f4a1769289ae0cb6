use std::collections::BTreeMap;
use tracing::debug;

use crate::server::session::{Session, SessionId};

/// Outcome of visiting one session during [`Registry::for_each`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Keep,
    /// Remove the session once the traversal has finished.
    Remove,
}

/// The live sessions, kept in registration order.
///
/// Ids are handed out in increasing order, so ordering the map by id is
/// ordering it by registration.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: BTreeMap<SessionId, Session>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the id for the next session to be added.
    pub fn next_id(&mut self) -> SessionId {
        self.next_id += 1;
        SessionId(self.next_id)
    }

    /// Adds a session to the registry.
    pub fn add(&mut self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    /// Removes a session by id, handing it back so the caller can close it.
    ///
    /// Returns `None` if it was already removed.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Visits every session in registration order.
    ///
    /// Sessions the visitor asks to remove stay in place until the traversal
    /// ends, so no other session is skipped or visited twice. The removed
    /// sessions are returned in registration order.
    pub fn for_each<F>(&mut self, mut visit: F) -> Vec<Session>
    where
        F: FnMut(&Session) -> Visit,
    {
        let doomed: Vec<SessionId> = self
            .sessions
            .values()
            .filter_map(|session| (visit(session) == Visit::Remove).then_some(session.id))
            .collect();

        doomed
            .into_iter()
            .filter_map(|id| {
                debug!("Removing session {} after traversal", id);
                self.sessions.remove(&id)
            })
            .collect()
    }

    /// Empties the registry, yielding sessions in registration order.
    pub fn drain(&mut self) -> Vec<Session> {
        std::mem::take(&mut self.sessions).into_values().collect()
    }
}
