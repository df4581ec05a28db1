//! In-memory session registry
//!
//! Concurrent map keyed by call id. Insertion happens once at `start_call`,
//! removal once at terminal state; re-inserting an id is an error. Lifetime
//! counters are tracked for monitoring.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::session::CallSession;
use crate::types::{CallId, CallState};

/// Lifetime statistics of the session store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStoreStats {
    pub active_sessions: usize,
    pub total_created: usize,
    pub total_completed: usize,
    pub total_failed: usize,
}

/// Registry of active call sessions
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<CallId, Arc<CallSession>>,
    total_created: AtomicUsize,
    total_completed: AtomicUsize,
    total_failed: AtomicUsize,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session; a session id is never re-inserted
    pub fn insert(&self, session: Arc<CallSession>) -> Result<()> {
        let call_id = session.call_id.clone();
        match self.sessions.entry(call_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::invalid_state(
                format!("session {} already registered", call_id),
            )),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(session);
                self.total_created.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("registered session {}", call_id);
                Ok(())
            }
        }
    }

    pub fn get(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        self.sessions.get(call_id).map(|s| Arc::clone(&s))
    }

    /// Remove a session at its terminal state
    pub fn remove(&self, call_id: &CallId) -> Option<Arc<CallSession>> {
        let removed = self.sessions.remove(call_id).map(|(_, s)| s);
        if let Some(session) = &removed {
            match session.state() {
                CallState::Failed { .. } => {
                    self.total_failed.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    self.total_completed.fetch_add(1, Ordering::Relaxed);
                }
            }
            tracing::debug!("evicted session {}", call_id);
        }
        removed
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.sessions.contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Ids of all active sessions
    pub fn active_ids(&self) -> Vec<CallId> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// All active sessions (used by shutdown to drain)
    pub fn active_sessions(&self) -> Vec<Arc<CallSession>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn stats(&self) -> SessionStoreStats {
        SessionStoreStats {
            active_sessions: self.sessions.len(),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_completed: self.total_completed.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
        }
    }
}
