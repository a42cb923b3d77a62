//! Persisted session state shared by the request pipeline, the refresh
//! coordinator, and the event stream client.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::warn;

/// Keys the transport layer reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    AccessToken,
    RefreshToken,
    UserProfile,
    Permissions,
    MenuTree,
    RememberUntil,
    LogoutReason,
}

impl SessionKey {
    /// Every key the store may hold.
    pub const ALL: [SessionKey; 7] = [
        Self::AccessToken,
        Self::RefreshToken,
        Self::UserProfile,
        Self::Permissions,
        Self::MenuTree,
        Self::RememberUntil,
        Self::LogoutReason,
    ];

    /// Keys destroyed together with the session. The logout reason is not
    /// among them: it has to survive until the login screen takes it.
    pub const SESSION_SCOPED: [SessionKey; 6] = [
        Self::AccessToken,
        Self::RefreshToken,
        Self::UserProfile,
        Self::Permissions,
        Self::MenuTree,
        Self::RememberUntil,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AccessToken => "access_token",
            Self::RefreshToken => "refresh_token",
            Self::UserProfile => "user_profile",
            Self::Permissions => "permissions",
            Self::MenuTree => "menu_tree",
            Self::RememberUntil => "remember_until",
            Self::LogoutReason => "logout_reason",
        }
    }
}

/// Credential pair currently held by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

/// Key/value persistence for session state.
///
/// Implementations decide the medium; the transport layer only ever goes
/// through this interface, so swapping disk for memory (or anything else)
/// never touches coordination logic.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: SessionKey) -> Option<String>;
    fn put(&self, key: SessionKey, value: String);
    fn remove(&self, key: SessionKey) -> Option<String>;

    /// Current credential pair. Empty strings count as absent.
    fn session(&self) -> Session {
        Session {
            access_token: self
                .get(SessionKey::AccessToken)
                .filter(|token| !token.is_empty()),
            refresh_token: self
                .get(SessionKey::RefreshToken)
                .filter(|token| !token.is_empty()),
        }
    }

    /// Persist a freshly issued credential pair.
    fn set_tokens(&self, access_token: &str, refresh_token: &str) {
        self.put(SessionKey::AccessToken, access_token.to_string());
        self.put(SessionKey::RefreshToken, refresh_token.to_string());
    }

    /// Remove every session-scoped key, leaving the one-shot logout reason in
    /// place.
    fn clear_session(&self) {
        for key in SessionKey::SESSION_SCOPED {
            self.remove(key);
        }
    }

    /// Take the one-shot logout reason, clearing it.
    fn take_logout_reason(&self) -> Option<String> {
        self.remove(SessionKey::LogoutReason)
    }

    /// Remember-me expiry, if one was stored and is readable.
    fn remember_until(&self) -> Option<DateTime<Utc>> {
        let raw = self.get(SessionKey::RememberUntil)?;
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(parsed) => Some(parsed.with_timezone(&Utc)),
            Err(error) => {
                warn!("unreadable remember-until marker '{}': {}", raw, error);
                None
            }
        }
    }

    fn set_remember_until(&self, until: DateTime<Utc>) {
        self.put(SessionKey::RememberUntil, until.to_rfc3339());
    }
}

/// In-memory store, the default for tests and short-lived tools.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<SessionKey, String>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: SessionKey) -> Option<String> {
        lock(&self.entries).get(&key).cloned()
    }

    fn put(&self, key: SessionKey, value: String) {
        lock(&self.entries).insert(key, value);
    }

    fn remove(&self, key: SessionKey) -> Option<String> {
        lock(&self.entries).remove(&key)
    }
}

/// Store backed by a single JSON document on disk.
///
/// The in-memory map stays authoritative; disk writes that fail are logged
/// and the session keeps working for the life of the process.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    entries: Mutex<HashMap<SessionKey, String>>,
}

impl FileSessionStore {
    /// Load the store from `path`, starting empty when the file is missing or
    /// unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_document(&path);
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<SessionKey, String>) {
        let document: HashMap<&'static str, &String> = entries
            .iter()
            .map(|(key, value)| (key.as_str(), value))
            .collect();
        match serde_json::to_vec_pretty(&document) {
            Ok(bytes) => {
                if let Err(error) = std::fs::write(&self.path, bytes) {
                    warn!(
                        "failed to persist session file {}: {}",
                        self.path.display(),
                        error
                    );
                }
            }
            Err(error) => warn!("failed to encode session document: {}", error),
        }
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: SessionKey) -> Option<String> {
        lock(&self.entries).get(&key).cloned()
    }

    fn put(&self, key: SessionKey, value: String) {
        let mut entries = lock(&self.entries);
        entries.insert(key, value);
        self.persist(&entries);
    }

    fn remove(&self, key: SessionKey) -> Option<String> {
        let mut entries = lock(&self.entries);
        let previous = entries.remove(&key);
        if previous.is_some() {
            self.persist(&entries);
        }
        previous
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn load_document(path: &Path) -> HashMap<SessionKey, String> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(error) => {
            warn!("failed to read session file {}: {}", path.display(), error);
            return HashMap::new();
        }
    };

    let document: HashMap<String, String> = match serde_json::from_slice(&bytes) {
        Ok(document) => document,
        Err(error) => {
            warn!("unreadable session file {}: {}", path.display(), error);
            return HashMap::new();
        }
    };

    let mut entries = HashMap::new();
    for key in SessionKey::ALL {
        if let Some(value) = document.get(key.as_str()) {
            entries.insert(key, value.clone());
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn memory_store_round_trips_values() {
        let store = MemorySessionStore::new();
        store.put(SessionKey::AccessToken, "token-1".to_string());
        assert_eq!(store.get(SessionKey::AccessToken).as_deref(), Some("token-1"));
        assert_eq!(store.remove(SessionKey::AccessToken).as_deref(), Some("token-1"));
        assert!(store.get(SessionKey::AccessToken).is_none());
    }

    #[test]
    fn session_treats_empty_tokens_as_absent() {
        let store = MemorySessionStore::new();
        store.put(SessionKey::AccessToken, String::new());
        store.put(SessionKey::RefreshToken, "refresh-1".to_string());

        let session = store.session();
        assert!(session.access_token.is_none());
        assert_eq!(session.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[test]
    fn clear_session_spares_the_logout_reason() {
        let store = MemorySessionStore::new();
        store.set_tokens("token-1", "refresh-1");
        store.put(SessionKey::MenuTree, "[]".to_string());
        store.put(SessionKey::LogoutReason, "signed in elsewhere".to_string());

        store.clear_session();

        assert_eq!(store.session(), Session::default());
        assert!(store.get(SessionKey::MenuTree).is_none());
        assert_eq!(
            store.take_logout_reason().as_deref(),
            Some("signed in elsewhere")
        );
        assert!(store.take_logout_reason().is_none(), "reason is one-shot");
    }

    #[test]
    fn remember_until_round_trips_and_tolerates_garbage() {
        let store = MemorySessionStore::new();
        assert!(store.remember_until().is_none());

        let until = Utc.with_ymd_and_hms(2026, 9, 1, 8, 0, 0).single().expect("timestamp");
        store.set_remember_until(until);
        assert_eq!(store.remember_until(), Some(until));

        store.put(SessionKey::RememberUntil, "not a timestamp".to_string());
        assert!(store.remember_until().is_none());
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");

        let store = FileSessionStore::open(&path);
        store.set_tokens("token-1", "refresh-1");
        store.put(SessionKey::Permissions, "[\"vector:read\"]".to_string());
        drop(store);

        let reopened = FileSessionStore::open(&path);
        assert_eq!(reopened.get(SessionKey::AccessToken).as_deref(), Some("token-1"));
        assert_eq!(
            reopened.get(SessionKey::Permissions).as_deref(),
            Some("[\"vector:read\"]")
        );

        reopened.clear_session();
        let cleared = FileSessionStore::open(&path);
        assert!(cleared.get(SessionKey::AccessToken).is_none());
        assert!(cleared.get(SessionKey::Permissions).is_none());
    }

    #[test]
    fn file_store_starts_empty_on_garbage_document() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        std::fs::write(&path, b"{ not json").expect("write garbage");

        let store = FileSessionStore::open(&path);
        assert!(store.get(SessionKey::AccessToken).is_none());

        store.put(SessionKey::AccessToken, "token-1".to_string());
        let reopened = FileSessionStore::open(&path);
        assert_eq!(reopened.get(SessionKey::AccessToken).as_deref(), Some("token-1"));
    }

    #[test]
    fn file_store_ignores_unknown_document_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        std::fs::write(
            &path,
            br#"{"access_token": "token-1", "someday_key": "ignored"}"#,
        )
        .expect("write document");

        let store = FileSessionStore::open(&path);
        assert_eq!(store.get(SessionKey::AccessToken).as_deref(), Some("token-1"));
    }
}
