//! Pairing session persistence.
//!
//! Holds the session id and resolved user id issued when a pairing code is
//! verified. The pair is written in one file so the two fields can never get
//! out of step: a file that fails to parse (or is missing either field) is
//! treated as "no session".

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
}

/// Key-value persistence for the pairing session with an in-memory mirror.
///
/// Durable-storage failure never surfaces as an error; the store degrades to
/// memory-only operation (session lost on restart) with a warning.
pub struct SessionStore {
    path: Option<PathBuf>,
    cached: Mutex<Option<Session>>,
}

impl SessionStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            cached: Mutex::new(None),
        }
    }

    /// Persist both fields atomically and update the in-memory mirror.
    pub fn set(&self, session_id: impl Into<String>, user_id: impl Into<String>) {
        let session = Session {
            session_id: session_id.into(),
            user_id: user_id.into(),
        };

        if let Some(path) = &self.path {
            match serde_json::to_string_pretty(&session) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(path, json) {
                        tracing::warn!("Could not persist session, keeping in memory only: {}", e);
                    }
                }
                Err(e) => tracing::warn!("Could not serialize session: {}", e),
            }
        }

        *self.cached.lock().unwrap() = Some(session);
    }

    /// Current session, hydrating from durable storage on first access.
    pub fn get(&self) -> Option<Session> {
        let mut cached = self.cached.lock().unwrap();
        if cached.is_some() {
            return cached.clone();
        }

        let path = self.path.as_ref()?;
        let content = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<Session>(&content) {
            Ok(session) => {
                *cached = Some(session.clone());
                Some(session)
            }
            Err(e) => {
                tracing::warn!("Ignoring unreadable session file: {}", e);
                None
            }
        }
    }

    /// User id for the active session, if any.
    pub fn user_id(&self) -> Option<String> {
        self.get().map(|s| s.user_id)
    }

    /// Session id for the active session, if any.
    pub fn session_id(&self) -> Option<String> {
        self.get().map(|s| s.session_id)
    }

    /// Remove the session from memory and durable storage. Idempotent.
    pub fn clear(&self) {
        *self.cached.lock().unwrap() = None;

        if let Some(path) = &self.path {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    tracing::warn!("Could not remove session file: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_clear_in_memory() {
        let store = SessionStore::new(None);
        assert!(store.get().is_none());

        store.set("s-1", "u-1");
        let session = store.get().unwrap();
        assert_eq!(session.session_id, "s-1");
        assert_eq!(session.user_id, "u-1");

        store.clear();
        assert!(store.get().is_none());
        // clear is idempotent
        store.clear();
    }

    #[test]
    fn test_hydrates_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = SessionStore::new(Some(path.clone()));
        store.set("s-2", "u-2");

        // A fresh store over the same file sees the session (restart survival)
        let restarted = SessionStore::new(Some(path));
        let session = restarted.get().unwrap();
        assert_eq!(session.session_id, "s-2");
        assert_eq!(session.user_id, "u-2");
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        let store = SessionStore::new(Some(path.clone()));
        store.set("s-3", "u-3");
        assert!(path.exists());

        store.clear();
        assert!(!path.exists());
        assert!(SessionStore::new(Some(path)).get().is_none());
    }

    #[test]
    fn test_partial_file_is_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        // A dangling session id without a user id must read as "no session"
        std::fs::write(&path, r#"{"session_id": "s-4"}"#).unwrap();

        let store = SessionStore::new(Some(path));
        assert!(store.get().is_none());
    }

    #[test]
    fn test_unwritable_path_degrades_to_memory() {
        let store = SessionStore::new(Some(PathBuf::from(
            "/nonexistent-dir/definitely/missing/session.json",
        )));
        store.set("s-5", "u-5");
        assert_eq!(store.get().unwrap().user_id, "u-5");
    }
}
