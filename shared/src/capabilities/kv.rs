use crux_kv::error::KeyValueError;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::warn;

use crate::event::Event;

use super::KeyValue;

/// Keys the core persists. Anything else in the store belongs to someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KvKey {
    AccessToken,
    RefreshToken,
    UserData,
    DriverOnline,
}

impl KvKey {
    pub const ALL: [KvKey; 4] = [
        KvKey::AccessToken,
        KvKey::RefreshToken,
        KvKey::UserData,
        KvKey::DriverOnline,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            KvKey::AccessToken => "access_token",
            KvKey::RefreshToken => "refresh_token",
            KvKey::UserData => "user_data",
            KvKey::DriverOnline => "driver_online",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == raw)
    }

    #[must_use]
    pub const fn is_secret(self) -> bool {
        matches!(self, KvKey::AccessToken | KvKey::RefreshToken)
    }

    /// Write `value` under this key. The outcome comes back as
    /// `Event::StorageWritten`.
    pub fn set(self, value: impl Into<String>, kv: &KeyValue<Event>) {
        let value: String = value.into();
        kv.set(self.as_str().to_string(), value.into_bytes(), move |result| {
            Event::StorageWritten {
                key: self,
                result: result.map(|_| ()).map_err(KvError::from),
            }
        });
    }

    pub fn delete(self, kv: &KeyValue<Event>) {
        kv.delete(self.as_str().to_string(), move |result| Event::StorageWritten {
            key: self,
            result: result.map(|_| ()).map_err(KvError::from),
        });
    }
}

impl fmt::Display for KvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values read back from durable storage.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct StorageSnapshot {
    values: BTreeMap<KvKey, String>,
}

impl StorageSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: KvKey, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: KvKey, value: impl Into<String>) {
        self.values.insert(key, value.into());
    }

    #[must_use]
    pub fn get(&self, key: KvKey) -> Option<&str> {
        self.values.get(&key).map(String::as_str)
    }

    #[must_use]
    pub fn flag(&self, key: KvKey) -> bool {
        self.get(key) == Some("true")
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for StorageSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// Read every key the core owns. Keys that are missing, unreadable or not
/// UTF-8 are left out of the snapshot.
pub async fn read_snapshot(kv: KeyValue<Event>) -> StorageSnapshot {
    let reads = KvKey::ALL.map(|key| {
        let kv = kv.clone();
        async move { (key, kv.get_async(key.as_str().to_string()).await) }
    });

    let mut snapshot = StorageSnapshot::new();
    for (key, result) in join_all(reads).await {
        match result {
            Ok(Some(bytes)) => match String::from_utf8(bytes) {
                Ok(value) => snapshot.insert(key, value),
                Err(_) => warn!(%key, "stored value is not UTF-8, ignoring"),
            },
            Ok(None) => {}
            Err(e) => warn!(%key, error = %e, "storage read failed"),
        }
    }
    snapshot
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("storage unavailable: {message}")]
    Unavailable { message: String },

    #[error("storage operation failed on '{key}': {message}")]
    Backend { key: String, message: String },
}

impl From<KeyValueError> for KvError {
    fn from(err: KeyValueError) -> Self {
        match err {
            KeyValueError::Io { message } | KeyValueError::Other { message } => {
                KvError::Unavailable { message }
            }
            other => KvError::Unavailable {
                message: other.to_string(),
            },
        }
    }
}

impl From<&KvError> for KeyValueError {
    fn from(err: &KvError) -> Self {
        match err {
            KvError::Unavailable { message } => KeyValueError::Io {
                message: message.clone(),
            },
            KvError::Backend { .. } => KeyValueError::Other {
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names_match_storage_layout() {
        assert_eq!(KvKey::AccessToken.as_str(), "access_token");
        assert_eq!(KvKey::UserData.as_str(), "user_data");
        assert_eq!(KvKey::parse("driver_online"), Some(KvKey::DriverOnline));
        assert_eq!(KvKey::parse("something_else"), None);
    }

    #[test]
    fn test_snapshot_debug_lists_keys_only() {
        let snapshot = StorageSnapshot::new().with(KvKey::AccessToken, "at-secret");
        let printed = format!("{snapshot:?}");
        assert!(printed.contains("AccessToken"));
        assert!(!printed.contains("at-secret"));
    }

    #[test]
    fn test_snapshot_flag() {
        let snapshot = StorageSnapshot::new().with(KvKey::DriverOnline, "true");
        assert!(snapshot.flag(KvKey::DriverOnline));
        assert!(!StorageSnapshot::new().flag(KvKey::DriverOnline));
    }

    #[test]
    fn test_key_value_errors_round_trip_through_kv_error() {
        let err = KvError::from(KeyValueError::Timeout);
        assert!(err.to_string().contains("timeout"));

        let back = KeyValueError::from(&KvError::Unavailable {
            message: "disk full".into(),
        });
        assert_eq!(
            back,
            KeyValueError::Io {
                message: "disk full".into()
            }
        );
    }
}
