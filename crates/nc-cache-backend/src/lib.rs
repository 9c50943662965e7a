#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use nc_types::CacheGetType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub mod memory;
pub mod pattern;
pub mod sqlite;

pub use memory::InMemoryBackend;
pub use pattern::GlobPattern;
pub use sqlite::SqliteBackend;

/// Physical form of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Text(String),
    Set(BTreeSet<String>),
}

impl StoredValue {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Set(_) => "set",
        }
    }

    #[must_use]
    pub fn is_empty_set(&self) -> bool {
        matches!(self, Self::Set(members) if members.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Pattern(#[from] regex::Error),
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
    #[error("key {key} holds a {found} value where a set was expected")]
    WrongType { key: String, found: &'static str },
}

/// Physical key/value store behind the metadata cache.
///
/// Set operations follow Redis semantics: adding to a missing key creates
/// the set, and removing the last member removes the key.
pub trait CacheBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn get(&self, key: &str) -> Result<Option<StoredValue>, BackendError>;

    /// Stores `value`, replacing whatever `key` held. An empty set is a no-op.
    fn set(
        &self,
        key: &str,
        value: StoredValue,
        expires_at_ms: Option<u64>,
    ) -> Result<(), BackendError>;

    /// Removes `keys`, returning how many existed.
    fn del(&self, keys: &[String]) -> Result<usize, BackendError>;

    fn exists(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.get(key)?.is_some())
    }

    fn add_members(&self, key: &str, members: &[String]) -> Result<(), BackendError>;

    fn remove_member(&self, key: &str, member: &str) -> Result<bool, BackendError>;

    /// Keys matching a glob pattern (`*` and `?` wildcards).
    fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, BackendError>;

    fn export_all(&self) -> Result<BTreeMap<String, StoredValue>, BackendError>;
}

/// Coerces a stored value into the requested read shape.
///
/// Object reads parse JSON text and fall back to the raw string when the
/// text is not valid JSON.
#[must_use]
pub fn decode(stored: &StoredValue, get_type: CacheGetType) -> Value {
    match (stored, get_type) {
        (StoredValue::Set(members), _) => {
            Value::Array(members.iter().cloned().map(Value::String).collect())
        }
        (StoredValue::Text(text), CacheGetType::Scalar) => Value::String(text.clone()),
        (StoredValue::Text(text), CacheGetType::Array) => match serde_json::from_str(text) {
            Ok(Value::Array(items)) => Value::Array(items),
            _ => Value::String(text.clone()),
        },
        (StoredValue::Text(text), CacheGetType::Object) => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone()))
        }
    }
}

#[must_use]
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn is_expired(expires_at_ms: Option<u64>, now_ms: u64) -> bool {
    expires_at_ms.is_some_and(|deadline| deadline <= now_ms)
}
