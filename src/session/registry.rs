//! # Session Registry
//!
//! Process-wide index of live realtime sessions.
//!
//! ## Thread Safety:
//! The registry is cloned into every HTTP worker. All clones share one
//! `Arc<RwLock<HashMap>>`: upgrade requests and health checks read it, the
//! session actors write their own entry as they change state.
//!
//! ## Resource Management:
//! - Enforces `max_concurrent_sessions` at WebSocket upgrade time
//! - Each session actor removes its entry when it stops
//! - Entries only hold bookkeeping; session data lives in the actor

use crate::error::AppError;
use crate::session::machine::SessionState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Clone, Serialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub active_sessions: usize,
    pub max_sessions: usize,
    pub state_counts: HashMap<&'static str, usize>,
}

#[derive(Debug, Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    max_concurrent_sessions: Arc<AtomicUsize>,
}

impl SessionRegistry {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_concurrent_sessions: Arc::new(AtomicUsize::new(max_concurrent_sessions)),
        }
    }

    /// Change the cap. Sessions already over a lowered cap are left running.
    pub fn set_max_concurrent_sessions(&self, max: usize) {
        self.max_concurrent_sessions.store(max, Ordering::Relaxed);
    }

    pub fn max_concurrent_sessions(&self) -> usize {
        self.max_concurrent_sessions.load(Ordering::Relaxed)
    }

    /// Reserve a slot for a new session.
    ///
    /// ## Returns:
    /// - **Ok(())**: the session is registered in `CREATED`
    /// - **Err(Unavailable)**: the concurrent session limit is reached
    pub fn register(&self, session_id: &str) -> Result<(), AppError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        let max = self.max_concurrent_sessions();
        if sessions.len() >= max {
            return Err(AppError::Unavailable(format!(
                "Maximum concurrent sessions ({}) reached",
                max
            )));
        }
        if sessions.contains_key(session_id) {
            return Err(AppError::Internal(format!("Session ID '{}' already exists", session_id)));
        }

        let now = Utc::now();
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                session_id: session_id.to_string(),
                state: SessionState::Created,
                created_at: now,
                last_activity: now,
            },
        );
        Ok(())
    }

    /// Record activity and the session's current state.
    pub fn touch(&self, session_id: &str, state: SessionState) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.state = state;
            entry.last_activity = Utc::now();
        }
    }

    pub fn remove(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(session_id).is_some()
    }

    #[cfg(test)]
    pub fn get(&self, session_id: &str) -> Option<SessionEntry> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(session_id).cloned()
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn summary(&self) -> RegistrySummary {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);

        let mut state_counts = HashMap::new();
        for entry in sessions.values() {
            *state_counts.entry(entry.state.as_str()).or_insert(0) += 1;
        }

        RegistrySummary {
            active_sessions: sessions.len(),
            max_sessions: self.max_concurrent_sessions(),
            state_counts,
        }
    }
}
