//! # Session Registry
//!
//! Process-wide table of active voice sessions per user. The gateway asks the
//! registry for admission before a session is constructed and releases the
//! slot exactly once on disconnect. The table is owned and lock-guarded; no
//! ambient global state.
//!
//! ## Invariants:
//! - A user never holds more than `max_sessions_per_user` concurrent sessions.
//! - Entries are removed eagerly when a user's last session ends, so the map
//!   never accumulates empty sets.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use uuid::Uuid;

/// Admission refused: the user is already at the configured session cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDenied {
    pub active: usize,
    pub cap: usize,
}

impl fmt::Display for AdmissionDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "too many active sessions ({} of {})",
            self.active, self.cap
        )
    }
}

/// Tracks which sessions each user currently holds.
///
/// All operations take the inner lock for their full duration, so concurrent
/// connects and disconnects for the same user serialize on the cap check.
pub struct SessionRegistry {
    max_sessions_per_user: usize,
    entries: Mutex<HashMap<String, HashSet<String>>>,
}

impl SessionRegistry {
    pub fn new(max_sessions_per_user: usize) -> Self {
        Self {
            max_sessions_per_user,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Admit one session for `user_id`, returning the freshly assigned
    /// session id, or refuse when the user is at the cap.
    pub fn admit(&self, user_id: &str) -> Result<String, AdmissionDenied> {
        let mut entries = self.entries.lock().unwrap();

        let active = entries.get(user_id).map(HashSet::len).unwrap_or(0);
        if active >= self.max_sessions_per_user {
            return Err(AdmissionDenied {
                active,
                cap: self.max_sessions_per_user,
            });
        }

        let session_id = Uuid::new_v4().to_string();
        entries
            .entry(user_id.to_string())
            .or_default()
            .insert(session_id.clone());
        Ok(session_id)
    }

    /// Release a session slot. Idempotent: releasing an unknown session or an
    /// unknown user is a no-op, so teardown paths can call this
    /// unconditionally.
    pub fn release(&self, user_id: &str, session_id: &str) {
        let mut entries = self.entries.lock().unwrap();

        if let Some(sessions) = entries.get_mut(user_id) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                entries.remove(user_id);
            }
        }
    }

    /// Number of sessions the user currently holds.
    pub fn active_sessions(&self, user_id: &str) -> usize {
        self.entries
            .lock()
            .unwrap()
            .get(user_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Total number of active sessions across all users.
    pub fn total_sessions(&self) -> usize {
        self.entries.lock().unwrap().values().map(HashSet::len).sum()
    }

    /// Number of users with at least one active session.
    pub fn active_users(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn max_sessions_per_user(&self) -> usize {
        self.max_sessions_per_user
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_admits_up_to_cap() {
        let registry = SessionRegistry::new(3);
        for _ in 0..3 {
            assert!(registry.admit("alice").is_ok());
        }
        let denied = registry.admit("alice").unwrap_err();
        assert_eq!(denied, AdmissionDenied { active: 3, cap: 3 });
    }

    #[test]
    fn test_caps_are_per_user() {
        let registry = SessionRegistry::new(1);
        assert!(registry.admit("alice").is_ok());
        assert!(registry.admit("bob").is_ok());
        assert!(registry.admit("alice").is_err());
    }

    #[test]
    fn test_release_frees_exactly_one_slot() {
        let registry = SessionRegistry::new(2);
        let first = registry.admit("alice").unwrap();
        let _second = registry.admit("alice").unwrap();
        assert!(registry.admit("alice").is_err());

        registry.release("alice", &first);
        assert_eq!(registry.active_sessions("alice"), 1);

        // Re-admitting up to the cap succeeds again.
        assert!(registry.admit("alice").is_ok());
        assert!(registry.admit("alice").is_err());
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = SessionRegistry::new(2);
        let session = registry.admit("alice").unwrap();

        registry.release("alice", &session);
        registry.release("alice", &session);
        registry.release("alice", "never-admitted");
        registry.release("nobody", "never-admitted");

        assert_eq!(registry.active_sessions("alice"), 0);
    }

    #[test]
    fn test_empty_entries_are_removed_eagerly() {
        let registry = SessionRegistry::new(2);
        let session = registry.admit("alice").unwrap();
        assert_eq!(registry.active_users(), 1);

        registry.release("alice", &session);
        assert_eq!(registry.active_users(), 0);
        assert_eq!(registry.total_sessions(), 0);
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_cap() {
        let cap = 3;
        let registry = Arc::new(SessionRegistry::new(cap));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    if let Ok(session) = registry.admit("alice") {
                        assert!(registry.active_sessions("alice") <= cap);
                        registry.release("alice", &session);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.active_sessions("alice"), 0);
        assert_eq!(registry.active_users(), 0);
    }
}
