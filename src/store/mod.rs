//! Secure key/value persistence for session secrets and feature flags.
//!
//! [`SecureStore`] wraps a [`KeyValueBackend`] and never fails: backend
//! errors are handed to a [`StoreObserver`] and the operation degrades to
//! "absent". Losing persisted auth state only means the user signs in again.
//!
//! Backends:
//! - [`KeyringBackend`] - OS keychain (feature `system-keyring`)
//! - [`SqliteBackend`] - `auth_kv` table in a local SQLite file
//! - [`MemoryBackend`] - in-process map (tests, ephemeral runs)

mod memory;
mod sqlite;

#[cfg(feature = "system-keyring")]
mod keyring;

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

#[cfg(feature = "system-keyring")]
pub use self::keyring::KeyringBackend;

/// Keys persisted by the session components
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    AccessToken,
    RefreshToken,
    TokenExpiry,
    LastActivity,
    SessionUser,
    BiometricEnabled,
    LogoutOnClose,
}

impl StoreKey {
    pub const ALL: [StoreKey; 7] = [
        StoreKey::AccessToken,
        StoreKey::RefreshToken,
        StoreKey::TokenExpiry,
        StoreKey::LastActivity,
        StoreKey::SessionUser,
        StoreKey::BiometricEnabled,
        StoreKey::LogoutOnClose,
    ];

    /// Keys holding session secrets; all of them are erased on sign-out
    pub const SECRETS: [StoreKey; 5] = [
        StoreKey::AccessToken,
        StoreKey::RefreshToken,
        StoreKey::TokenExpiry,
        StoreKey::LastActivity,
        StoreKey::SessionUser,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            StoreKey::AccessToken => "access_token",
            StoreKey::RefreshToken => "refresh_token",
            StoreKey::TokenExpiry => "token_expiry",
            StoreKey::LastActivity => "last_activity",
            StoreKey::SessionUser => "session_user",
            StoreKey::BiometricEnabled => "biometric_enabled",
            StoreKey::LogoutOnClose => "logout_on_close",
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean preferences kept alongside the session secrets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureFlag {
    BiometricEnabled,
    LogoutOnClose,
}

impl FeatureFlag {
    const fn key(&self) -> StoreKey {
        match self {
            FeatureFlag::BiometricEnabled => StoreKey::BiometricEnabled,
            FeatureFlag::LogoutOnClose => StoreKey::LogoutOnClose,
        }
    }
}

/// Errors raised by storage backends
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Raw storage backend. Implementations may fail; [`SecureStore`] absorbs it.
pub trait KeyValueBackend: Send + Sync {
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Name of this backend, for logs
    fn name(&self) -> &'static str;
}

/// Store operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Set,
    Get,
    Delete,
}

impl StoreOp {
    pub const fn as_str(&self) -> &'static str {
        match self {
            StoreOp::Set => "set",
            StoreOp::Get => "get",
            StoreOp::Delete => "delete",
        }
    }
}

/// A swallowed backend failure, as reported to the observer
#[derive(Debug, Clone)]
pub struct StoreFailure {
    pub op: StoreOp,
    pub key: StoreKey,
    pub backend: &'static str,
    pub error: String,
}

/// Callback invoked for every swallowed backend failure
pub type StoreObserver = Arc<dyn Fn(&StoreFailure) + Send + Sync>;

/// Observer that only logs
pub fn log_observer() -> StoreObserver {
    Arc::new(|failure: &StoreFailure| {
        tracing::warn!(
            op = failure.op.as_str(),
            key = %failure.key,
            backend = failure.backend,
            error = %failure.error,
            "Secure store operation failed, continuing without persisted state"
        );
    })
}

/// Never-failing facade over a storage backend
pub struct SecureStore {
    backend: Box<dyn KeyValueBackend>,
    observer: StoreObserver,
}

impl SecureStore {
    /// Create a store that reports failures through the logging observer
    pub fn new(backend: impl KeyValueBackend + 'static) -> Self {
        Self::with_observer(backend, log_observer())
    }

    pub fn with_observer(backend: impl KeyValueBackend + 'static, observer: StoreObserver) -> Self {
        Self {
            backend: Box::new(backend),
            observer,
        }
    }

    /// In-memory store, mostly for tests
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn set(&self, key: StoreKey, value: &str) {
        if let Err(e) = self.backend.set(key.as_str(), value) {
            self.report(StoreOp::Set, key, e);
        }
    }

    /// Read a key; backend failures read as absent
    pub fn get(&self, key: StoreKey) -> Option<String> {
        match self.backend.get(key.as_str()) {
            Ok(value) => value,
            Err(e) => {
                self.report(StoreOp::Get, key, e);
                None
            }
        }
    }

    pub fn delete(&self, key: StoreKey) {
        if let Err(e) = self.backend.delete(key.as_str()) {
            self.report(StoreOp::Delete, key, e);
        }
    }

    /// Delete every listed key; one failing key does not stop the rest
    pub fn clear(&self, keys: &[StoreKey]) {
        for key in keys {
            self.delete(*key);
        }
    }

    pub fn flag(&self, flag: FeatureFlag) -> bool {
        matches!(self.get(flag.key()).as_deref(), Some("true"))
    }

    pub fn set_flag(&self, flag: FeatureFlag, enabled: bool) {
        self.set(flag.key(), if enabled { "true" } else { "false" });
    }

    fn report(&self, op: StoreOp, key: StoreKey, error: StoreError) {
        let failure = StoreFailure {
            op,
            key,
            backend: self.backend.name(),
            error: error.to_string(),
        };
        (self.observer)(&failure);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Backend whose every operation fails
    pub(crate) struct BrokenBackend;

    impl KeyValueBackend for BrokenBackend {
        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Keyring("keychain locked".to_string()))
        }
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Keyring("keychain locked".to_string()))
        }
        fn delete(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Keyring("keychain locked".to_string()))
        }
        fn name(&self) -> &'static str {
            "broken"
        }
    }

    fn recording_observer() -> (StoreObserver, Arc<Mutex<Vec<StoreFailure>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: StoreObserver = Arc::new(move |failure: &StoreFailure| {
            sink.lock().unwrap().push(failure.clone());
        });
        (observer, seen)
    }

    #[test]
    fn test_set_get_delete() {
        let store = SecureStore::in_memory();
        assert_eq!(store.get(StoreKey::AccessToken), None);

        store.set(StoreKey::AccessToken, "abc");
        assert_eq!(store.get(StoreKey::AccessToken).as_deref(), Some("abc"));

        store.delete(StoreKey::AccessToken);
        assert_eq!(store.get(StoreKey::AccessToken), None);
    }

    #[test]
    fn test_clear_removes_every_listed_key() {
        let store = SecureStore::in_memory();
        for key in StoreKey::ALL {
            store.set(key, "value");
        }

        store.clear(&StoreKey::SECRETS);

        for key in StoreKey::SECRETS {
            assert_eq!(store.get(key), None, "{} survived clear", key);
        }
        assert!(store.get(StoreKey::LogoutOnClose).is_some());
    }

    #[test]
    fn test_failures_are_swallowed_and_observed() {
        let (observer, seen) = recording_observer();
        let store = SecureStore::with_observer(BrokenBackend, observer);

        store.set(StoreKey::AccessToken, "abc");
        assert_eq!(store.get(StoreKey::AccessToken), None);
        store.clear(&[StoreKey::AccessToken, StoreKey::RefreshToken]);

        let seen = seen.lock().unwrap();
        let ops: Vec<StoreOp> = seen.iter().map(|f| f.op).collect();
        assert_eq!(
            ops,
            vec![StoreOp::Set, StoreOp::Get, StoreOp::Delete, StoreOp::Delete]
        );
        assert_eq!(seen[0].backend, "broken");
        assert_eq!(seen[3].key, StoreKey::RefreshToken);
    }

    #[test]
    fn test_feature_flags() {
        let store = SecureStore::in_memory();
        assert!(!store.flag(FeatureFlag::BiometricEnabled));

        store.set_flag(FeatureFlag::BiometricEnabled, true);
        assert!(store.flag(FeatureFlag::BiometricEnabled));
        assert!(!store.flag(FeatureFlag::LogoutOnClose));

        store.set_flag(FeatureFlag::BiometricEnabled, false);
        assert!(!store.flag(FeatureFlag::BiometricEnabled));
    }

    #[test]
    fn test_flag_reads_false_when_backend_fails() {
        let store = SecureStore::with_observer(BrokenBackend, Arc::new(|_: &StoreFailure| {}));
        assert!(!store.flag(FeatureFlag::LogoutOnClose));
    }
}
