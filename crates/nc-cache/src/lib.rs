#![forbid(unsafe_code)]

//! Metadata cache manager.
//!
//! `MetaCache` is a cheap, clonable handle over a [`CacheBackend`]. It owns
//! the key conventions (namespace prefix, entity keys, membership lists) and
//! the two cascading invalidation modes. The backing metadata store stays the
//! source of truth: backend failures are logged and degrade to a miss or a
//! no-op, they never reach the caller.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use nc_cache_backend::{
    BackendError, CacheBackend, InMemoryBackend, SqliteBackend, StoredValue, decode, now_unix_ms,
};
use nc_types::{CacheDelDirection, CacheGetType, CacheScope};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod config;
pub mod keys;

pub use config::{CacheBackendKind, CacheConfig, ConfigError};
pub use keys::{NONE_MARKER, entity_key, is_list_key, list_key, member_key};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to open cache backend: {0}")]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Deadlines are capped to what every backend stores as signed milliseconds.
const MAX_DEADLINE_MS: u64 = i64::MAX as u64;

/// Members of a cached list, dereferenced into their objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedList {
    pub list: Vec<Map<String, Value>>,
    /// The list is cached as known-empty; the store need not be queried.
    pub is_none_list: bool,
}

impl CachedList {
    /// True when the caller has to fall back to the metadata store.
    #[must_use]
    pub fn is_miss(&self) -> bool {
        self.list.is_empty() && !self.is_none_list
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Numeric member field to sort by, ascending. Members lacking it sort last.
    pub order_by: Option<String>,
}

impl ListOptions {
    #[must_use]
    pub fn ordered_by(field: impl Into<String>) -> Self {
        Self {
            order_by: Some(field.into()),
        }
    }
}

#[derive(Clone)]
pub struct MetaCache {
    backend: Option<Arc<dyn CacheBackend>>,
    namespace: Arc<str>,
}

impl fmt::Debug for MetaCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaCache")
            .field("backend", &self.backend_name())
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl MetaCache {
    pub fn init(config: &CacheConfig) -> Result<Self, CacheError> {
        if config.namespace.trim().is_empty() {
            return Err(ConfigError::EmptyNamespace.into());
        }
        if config.disabled {
            info!(namespace = %config.namespace, "metadata cache disabled");
            return Ok(Self {
                backend: None,
                namespace: Arc::from(config.namespace.as_str()),
            });
        }

        let backend: Arc<dyn CacheBackend> = match &config.backend {
            CacheBackendKind::InMemory => Arc::new(InMemoryBackend::new()),
            CacheBackendKind::Sqlite { path } => Arc::new(SqliteBackend::open(path)?),
        };
        info!(
            backend = backend.name(),
            namespace = %config.namespace,
            "metadata cache initialised"
        );
        Ok(Self::with_backend(backend, config.namespace.as_str()))
    }

    /// A handle on which every operation is a no-op.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            backend: None,
            namespace: Arc::from(config::DEFAULT_NAMESPACE),
        }
    }

    #[must_use]
    pub fn with_backend(backend: Arc<dyn CacheBackend>, namespace: &str) -> Self {
        Self {
            backend: Some(backend),
            namespace: Arc::from(namespace),
        }
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(InMemoryBackend::new()), config::DEFAULT_NAMESPACE)
    }

    /// Releases this handle. The backend closes once every clone is gone.
    pub fn shutdown(self) {
        info!(
            backend = self.backend_name(),
            namespace = %self.namespace,
            "metadata cache shut down"
        );
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.as_ref().map_or("disabled", |backend| backend.name())
    }

    fn physical(&self, key: &str) -> String {
        format!("{}:{key}", self.namespace)
    }

    fn logical<'k>(&self, physical: &'k str) -> Option<&'k str> {
        physical
            .strip_prefix(&*self.namespace)
            .and_then(|rest| rest.strip_prefix(':'))
    }

    fn degrade<T>(op: &'static str, key: &str, result: Result<T, BackendError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(op, key, error = %err, "cache operation failed, treating as miss");
                None
            }
        }
    }

    fn read(&self, backend: &dyn CacheBackend, key: &str) -> Option<StoredValue> {
        Self::degrade("get", key, backend.get(&self.physical(key))).flatten()
    }

    fn write(
        &self,
        backend: &dyn CacheBackend,
        key: &str,
        value: StoredValue,
        expires_at_ms: Option<u64>,
    ) -> bool {
        Self::degrade(
            "set",
            key,
            backend.set(&self.physical(key), value, expires_at_ms),
        )
        .is_some()
    }

    fn remove(&self, backend: &dyn CacheBackend, keys: &[String]) -> bool {
        let physical = keys.iter().map(|key| self.physical(key)).collect::<Vec<_>>();
        let label = keys.first().map_or("", String::as_str);
        Self::degrade("del", label, backend.del(&physical)).is_some()
    }

    /// Fetches one entry coerced to `get_type`.
    ///
    /// Misses read as `Null`, or as an empty array for array reads.
    #[must_use]
    pub fn get(&self, key: &str, get_type: CacheGetType) -> Value {
        let Some(backend) = self.backend.as_deref() else {
            return empty_value(get_type);
        };
        match self.read(backend, key) {
            Some(stored) => decode(&stored, get_type),
            None => {
                debug!(key, "cache miss");
                empty_value(get_type)
            }
        }
    }

    #[must_use]
    pub fn get_object(&self, key: &str) -> Option<Map<String, Value>> {
        match self.get(key, CacheGetType::Object) {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Typed object read. Entries that no longer fit `T` count as a miss.
    #[must_use]
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let object = self.get_object(key)?;
        match serde_json::from_value(Value::Object(object)) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "cached object has an unexpected shape");
                None
            }
        }
    }

    /// Stores `value`: arrays become membership sets, objects JSON text and
    /// scalars their plain text. `Null` and empty arrays are accepted no-ops.
    pub fn set(&self, key: &str, value: &Value) -> bool {
        self.set_with_expiry(key, value, None)
    }

    pub fn set_expiring(&self, key: &str, value: &Value, ttl: Duration) -> bool {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let deadline = now_unix_ms().saturating_add(ttl_ms).min(MAX_DEADLINE_MS);
        self.set_with_expiry(key, value, Some(deadline))
    }

    /// Serialises `value` first; a value that cannot be represented as JSON
    /// is logged and skipped.
    pub fn set_serialized<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        if self.backend.is_none() {
            return true;
        }
        match serde_json::to_value(value) {
            Ok(json) => self.set(key, &json),
            Err(err) => {
                warn!(key, error = %err, "value could not be serialised for the cache");
                false
            }
        }
    }

    fn set_with_expiry(&self, key: &str, value: &Value, expires_at_ms: Option<u64>) -> bool {
        let Some(backend) = self.backend.as_deref() else {
            return true;
        };
        match encode_value(value) {
            Some(stored) => self.write(backend, key, stored, expires_at_ms),
            None => true,
        }
    }

    /// Shallow-merges `patch` into a cached object. Returns `false` on a miss.
    pub fn update(&self, key: &str, patch: &Map<String, Value>) -> bool {
        if self.backend.is_none() {
            return false;
        }
        let Some(mut object) = self.get_object(key) else {
            return false;
        };
        for (field, value) in patch {
            object.insert(field.clone(), value.clone());
        }
        self.set(key, &Value::Object(object))
    }

    pub fn del(&self, key: &str) -> bool {
        match self.backend.as_deref() {
            Some(backend) => self.remove(backend, &[key.to_owned()]),
            None => true,
        }
    }

    pub fn del_many(&self, keys: &[String]) -> bool {
        match self.backend.as_deref() {
            Some(backend) if !keys.is_empty() => self.remove(backend, keys),
            _ => true,
        }
    }

    fn matching(&self, backend: &dyn CacheBackend, pattern: &str) -> Vec<String> {
        Self::degrade(
            "keys",
            pattern,
            backend.keys_matching(&self.physical(pattern)),
        )
        .unwrap_or_default()
        .iter()
        .filter_map(|physical| self.logical(physical).map(str::to_owned))
        .collect()
    }

    /// Every entry whose logical key matches `pattern`, typed by key shape.
    #[must_use]
    pub fn get_all(&self, pattern: &str) -> BTreeMap<String, Value> {
        let Some(backend) = self.backend.as_deref() else {
            return BTreeMap::new();
        };
        self.matching(backend, pattern)
            .into_iter()
            .filter_map(|key| {
                let stored = self.read(backend, &key)?;
                let value = decode(&stored, export_get_type(&key));
                Some((key, value))
            })
            .collect()
    }

    /// Evicts every key of `scope` matching `pattern` (relative to the
    /// scope), cascading through lists first. Returns the matched count.
    pub fn del_all(&self, scope: CacheScope, pattern: &str) -> usize {
        let Some(backend) = self.backend.as_deref() else {
            return 0;
        };
        let matched = self.matching(backend, &format!("{scope}:{pattern}"));
        for key in &matched {
            let direction = if is_list_key(key) {
                CacheDelDirection::ParentToChild
            } else {
                CacheDelDirection::ChildToParent
            };
            self.deep_del(scope, key, direction);
        }
        if !matched.is_empty() {
            self.remove(backend, &matched);
        }
        matched.len()
    }

    #[must_use]
    pub fn get_list(&self, scope: CacheScope, sub_keys: &[&str]) -> CachedList {
        self.get_list_with(scope, sub_keys, &ListOptions::default())
    }

    /// Dereferences every member of a list.
    ///
    /// A list with an evicted member is incomplete: it is dropped and read
    /// as a miss so the caller rebuilds it from the store.
    #[must_use]
    pub fn get_list_with(
        &self,
        scope: CacheScope,
        sub_keys: &[&str],
        options: &ListOptions,
    ) -> CachedList {
        let Some(backend) = self.backend.as_deref() else {
            return CachedList::default();
        };
        let key = list_key(scope, sub_keys);
        let members = match self.read(backend, &key) {
            None => {
                debug!(key = %key, "list cache miss");
                return CachedList::default();
            }
            Some(StoredValue::Text(marker)) if marker == NONE_MARKER => {
                return CachedList {
                    list: Vec::new(),
                    is_none_list: true,
                };
            }
            Some(StoredValue::Text(_)) => {
                warn!(key = %key, "list key holds a plain value, dropping it");
                self.remove(backend, &[key]);
                return CachedList::default();
            }
            Some(StoredValue::Set(members)) => members,
        };

        let mut list = Vec::with_capacity(members.len());
        for member in &members {
            match self.read(backend, member) {
                Some(StoredValue::Text(text)) => match serde_json::from_str(&text) {
                    Ok(Value::Object(object)) => list.push(object),
                    _ => {
                        warn!(key = %key, member = %member, "list member is not an object");
                        self.remove(backend, &[key]);
                        return CachedList::default();
                    }
                },
                _ => {
                    debug!(key = %key, member = %member, "list member evicted, dropping list");
                    self.remove(backend, &[key]);
                    return CachedList::default();
                }
            }
        }

        if let Some(field) = options.order_by.as_deref() {
            list.sort_by(|a, b| compare_numeric_field(a, b, field));
        }
        CachedList {
            list,
            is_none_list: false,
        }
    }

    /// Writes each member under its own key, then replaces the list's member
    /// set in one write. An empty `members` records the list as known-empty.
    pub fn set_list(
        &self,
        scope: CacheScope,
        sub_keys: &[&str],
        members: &[Map<String, Value>],
    ) -> bool {
        let Some(backend) = self.backend.as_deref() else {
            return true;
        };
        let key = list_key(scope, sub_keys);
        if members.is_empty() {
            return self.write(backend, &key, StoredValue::Text(NONE_MARKER.to_owned()), None);
        }

        let mut member_keys = BTreeSet::new();
        for member in members {
            let Some(member_key) = member_key(scope, member) else {
                warn!(key = %key, %scope, "list member has no id, skipping");
                continue;
            };
            let text = Value::Object(member.clone()).to_string();
            if !self.write(backend, &member_key, StoredValue::Text(text), None) {
                return false;
            }
            member_keys.insert(member_key);
        }
        if member_keys.is_empty() {
            return false;
        }
        self.write(backend, &key, StoredValue::Set(member_keys), None)
    }

    /// Adds `member_key` to a list that is already cached.
    ///
    /// Returns `false` without writing when the list is cold, so a later
    /// `get_list` misses and rebuilds the full list from the store.
    pub fn append_to_list(&self, scope: CacheScope, sub_keys: &[&str], member_key: &str) -> bool {
        let Some(backend) = self.backend.as_deref() else {
            return false;
        };
        let key = list_key(scope, sub_keys);
        match self.read(backend, &key) {
            Some(StoredValue::Set(_)) => Self::degrade(
                "sadd",
                &key,
                backend.add_members(&self.physical(&key), &[member_key.to_owned()]),
            )
            .is_some(),
            Some(StoredValue::Text(marker)) if marker == NONE_MARKER => self.write(
                backend,
                &key,
                StoredValue::Set(BTreeSet::from([member_key.to_owned()])),
                None,
            ),
            Some(StoredValue::Text(_)) => {
                warn!(key = %key, "cannot append to a plain value");
                false
            }
            None => false,
        }
    }

    /// Cascading invalidation.
    ///
    /// `ChildToParent` unlinks `key` from every list of `scope` and then
    /// deletes it; `ParentToChild` deletes every member of the list `key` and
    /// then the list.
    pub fn deep_del(&self, scope: CacheScope, key: &str, direction: CacheDelDirection) -> bool {
        let Some(backend) = self.backend.as_deref() else {
            return true;
        };
        match direction {
            CacheDelDirection::ChildToParent => {
                let lists = self
                    .matching(backend, &format!("{scope}:*"))
                    .into_iter()
                    .filter(|candidate| is_list_key(candidate));
                for list in lists {
                    if !matches!(self.read(backend, &list), Some(StoredValue::Set(_))) {
                        continue;
                    }
                    let unlinked = backend.remove_member(&self.physical(&list), key);
                    if Self::degrade("srem", &list, unlinked).is_none() {
                        return false;
                    }
                }
                self.remove(backend, &[key.to_owned()])
            }
            CacheDelDirection::ParentToChild => {
                let mut doomed = match self.read(backend, key) {
                    Some(StoredValue::Set(members)) => members.into_iter().collect::<Vec<_>>(),
                    _ => Vec::new(),
                };
                doomed.push(key.to_owned());
                self.remove(backend, &doomed)
            }
        }
    }

    /// `deep_del` with the direction given by name. Unknown names are logged
    /// and report failure.
    pub fn deep_del_named(&self, scope: CacheScope, key: &str, direction: &str) -> bool {
        match direction.parse::<CacheDelDirection>() {
            Ok(direction) => self.deep_del(scope, key, direction),
            Err(err) => {
                warn!(key, %scope, error = %err, "invalid cache invalidation direction");
                false
            }
        }
    }

    /// Flushes every key of this namespace.
    pub fn destroy(&self) -> bool {
        let Some(backend) = self.backend.as_deref() else {
            return true;
        };
        let keys = self.matching(backend, "*");
        let flushed = keys.is_empty() || self.remove(backend, &keys);
        info!(namespace = %self.namespace, keys = keys.len(), "metadata cache destroyed");
        flushed
    }

    /// Every entry of this namespace, `:list` keys read as arrays and the
    /// rest as objects (raw text when not JSON).
    #[must_use]
    pub fn export(&self) -> BTreeMap<String, Value> {
        let Some(backend) = self.backend.as_deref() else {
            return BTreeMap::new();
        };
        let Some(entries) = Self::degrade("export", "*", backend.export_all()) else {
            return BTreeMap::new();
        };
        entries
            .into_iter()
            .filter_map(|(physical, stored)| {
                let key = self.logical(&physical)?.to_owned();
                let value = decode(&stored, export_get_type(&key));
                Some((key, value))
            })
            .collect()
    }
}

fn empty_value(get_type: CacheGetType) -> Value {
    match get_type {
        CacheGetType::Array => Value::Array(Vec::new()),
        CacheGetType::Scalar | CacheGetType::Object => Value::Null,
    }
}

fn export_get_type(key: &str) -> CacheGetType {
    if is_list_key(key) {
        CacheGetType::Array
    } else {
        CacheGetType::Object
    }
}

fn encode_value(value: &Value) -> Option<StoredValue> {
    match value {
        Value::Null => None,
        Value::Array(items) if items.is_empty() => None,
        Value::Array(items) => Some(StoredValue::Set(
            items
                .iter()
                .map(|item| match item {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .collect(),
        )),
        Value::Object(_) => Some(StoredValue::Text(value.to_string())),
        Value::String(text) => Some(StoredValue::Text(text.clone())),
        Value::Bool(_) | Value::Number(_) => Some(StoredValue::Text(value.to_string())),
    }
}

fn compare_numeric_field(a: &Map<String, Value>, b: &Map<String, Value>, field: &str) -> Ordering {
    let rank = |object: &Map<String, Value>| object.get(field).and_then(Value::as_f64);
    match (rank(a), rank(b)) {
        (Some(left), Some(right)) => left.total_cmp(&right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use nc_cache_backend::{BackendError, CacheBackend, InMemoryBackend, SqliteBackend, StoredValue};
    use nc_types::{CacheDelDirection, CacheGetType, CacheScope};
    use serde_json::{Map, Value, json};

    use super::{CacheConfig, ListOptions, MetaCache};

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    /// Backend whose every operation fails.
    #[derive(Debug)]
    struct BrokenBackend;

    impl CacheBackend for BrokenBackend {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn get(&self, _key: &str) -> Result<Option<StoredValue>, BackendError> {
            Err(BackendError::LockPoisoned("broken backend"))
        }

        fn set(
            &self,
            _key: &str,
            _value: StoredValue,
            _expires_at_ms: Option<u64>,
        ) -> Result<(), BackendError> {
            Err(BackendError::LockPoisoned("broken backend"))
        }

        fn del(&self, _keys: &[String]) -> Result<usize, BackendError> {
            Err(BackendError::LockPoisoned("broken backend"))
        }

        fn add_members(&self, _key: &str, _members: &[String]) -> Result<(), BackendError> {
            Err(BackendError::LockPoisoned("broken backend"))
        }

        fn remove_member(&self, _key: &str, _member: &str) -> Result<bool, BackendError> {
            Err(BackendError::LockPoisoned("broken backend"))
        }

        fn keys_matching(&self, _pattern: &str) -> Result<Vec<String>, BackendError> {
            Err(BackendError::LockPoisoned("broken backend"))
        }

        fn export_all(&self) -> Result<BTreeMap<String, StoredValue>, BackendError> {
            Err(BackendError::LockPoisoned("broken backend"))
        }
    }

    fn cache_with_backend() -> (MetaCache, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        let cache = MetaCache::with_backend(Arc::new(backend.clone()), "nc");
        (cache, backend)
    }

    #[test]
    fn disabled_cache_returns_typed_defaults() {
        let cache = MetaCache::init(&CacheConfig {
            disabled: true,
            ..CacheConfig::default()
        })
        .expect("init");
        assert!(!cache.is_enabled());
        assert!(cache.set("view:vw1", &json!({"id": "vw1"})));
        assert_eq!(cache.get("view:vw1", CacheGetType::Array), json!([]));
        assert_eq!(cache.get("view:vw1", CacheGetType::Object), Value::Null);
        assert!(cache.get_list(CacheScope::View, &["md1"]).list.is_empty());
        assert!(!cache.append_to_list(CacheScope::View, &["md1"], "view:vw1"));
        assert!(cache.export().is_empty());
    }

    #[test]
    fn keys_are_namespaced_in_the_backend() {
        let (cache, backend) = cache_with_backend();
        assert!(cache.set("project:p1", &json!({"id": "p1", "title": "CRM"})));
        assert!(backend.exists("nc:project:p1").expect("exists"));
        assert_eq!(
            cache.get("project:p1", CacheGetType::Object),
            json!({"id": "p1", "title": "CRM"})
        );
    }

    #[test]
    fn arrays_are_stored_as_sets_and_scalars_verbatim() {
        let (cache, backend) = cache_with_backend();
        assert!(cache.set("base:b1:list", &json!(["base:b1", 7])));
        assert_eq!(
            backend.get("nc:base:b1:list").expect("get"),
            Some(StoredValue::Set(
                ["7".to_owned(), "base:b1".to_owned()].into_iter().collect()
            ))
        );
        assert!(cache.set("hook:hk1:token", &json!("abc")));
        assert_eq!(cache.get("hook:hk1:token", CacheGetType::Scalar), json!("abc"));
        assert!(cache.set("hook:hk1:noop", &Value::Null));
        assert!(!backend.exists("nc:hook:hk1:noop").expect("exists"));
    }

    #[test]
    fn update_merges_into_cached_objects_only() {
        let (cache, _) = cache_with_backend();
        let patch = object(json!({"comparison_op": "neq"}));
        assert!(!cache.update("filterExp:fi1", &patch));
        cache.set("filterExp:fi1", &json!({"id": "fi1", "comparison_op": "eq"}));
        assert!(cache.update("filterExp:fi1", &patch));
        assert_eq!(
            cache.get_object("filterExp:fi1").expect("cached")["comparison_op"],
            json!("neq")
        );
    }

    #[test]
    fn empty_set_list_records_none_marker() {
        let (cache, _) = cache_with_backend();
        assert!(cache.set_list(CacheScope::FilterExp, &["vw1"], &[]));
        let cached = cache.get_list(CacheScope::FilterExp, &["vw1"]);
        assert!(cached.is_none_list);
        assert!(!cached.is_miss());

        assert!(cache.append_to_list(CacheScope::FilterExp, &["vw1"], "filterExp:fi1"));
        cache.set("filterExp:fi1", &json!({"id": "fi1"}));
        let cached = cache.get_list(CacheScope::FilterExp, &["vw1"]);
        assert!(!cached.is_none_list);
        assert_eq!(cached.list.len(), 1);
    }

    #[test]
    fn list_with_evicted_member_reads_as_miss() {
        let (cache, backend) = cache_with_backend();
        let members = vec![
            object(json!({"id": "fi1", "order": 2})),
            object(json!({"id": "fi2", "order": 1})),
        ];
        assert!(cache.set_list(CacheScope::FilterExp, &["vw1"], &members));
        cache.del("filterExp:fi2");

        let cached = cache.get_list(CacheScope::FilterExp, &["vw1"]);
        assert!(cached.is_miss());
        assert!(!backend.exists("nc:filterExp:vw1:list").expect("exists"));
    }

    #[test]
    fn ordered_reads_sort_numerically_with_missing_last() {
        let (cache, _) = cache_with_backend();
        let members = vec![
            object(json!({"id": "a", "order": 10})),
            object(json!({"id": "b"})),
            object(json!({"id": "c", "order": 2})),
        ];
        cache.set_list(CacheScope::View, &["md1"], &members);
        let ids = cache
            .get_list_with(CacheScope::View, &["md1"], &ListOptions::ordered_by("order"))
            .list
            .into_iter()
            .map(|member| member["id"].clone())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![json!("c"), json!("a"), json!("b")]);
    }

    #[test]
    fn members_without_id_are_skipped() {
        let (cache, backend) = cache_with_backend();
        let members = vec![object(json!({"title": "orphan"})), object(json!({"id": "vw1"}))];
        assert!(cache.set_list(CacheScope::View, &["md1"], &members));
        assert_eq!(
            backend.get("nc:view:md1:list").expect("get"),
            Some(StoredValue::Set(["view:vw1".to_owned()].into_iter().collect()))
        );
    }

    #[test]
    fn del_all_cascades_lists_before_deleting() {
        let (cache, backend) = cache_with_backend();
        cache.set_list(
            CacheScope::SingleQuery,
            &["md1"],
            &[object(json!({"id": "md1:vw1"}))],
        );
        cache.set("column:cl1", &json!({"id": "cl1"}));

        assert_eq!(cache.del_all(CacheScope::SingleQuery, "md1:*"), 2);
        assert!(!backend.exists("nc:singleQuery:md1:list").expect("exists"));
        assert!(!backend.exists("nc:singleQuery:md1:vw1").expect("exists"));
        assert!(backend.exists("nc:column:cl1").expect("exists"));
    }

    #[test]
    fn unknown_direction_name_fails_softly() {
        let (cache, _) = cache_with_backend();
        cache.set("view:vw1", &json!({"id": "vw1"}));
        assert!(!cache.deep_del_named(CacheScope::View, "view:vw1", "SIDEWAYS"));
        assert!(cache.get_object("view:vw1").is_some());
        assert!(cache.deep_del_named(CacheScope::View, "view:vw1", "CHILD_TO_PARENT"));
        assert!(cache.get_object("view:vw1").is_none());
    }

    #[test]
    fn child_to_parent_skips_known_empty_lists() {
        let (cache, _) = cache_with_backend();
        cache.set_list(CacheScope::FilterExp, &["fi9"], &[]);
        cache.set_list(CacheScope::FilterExp, &["vw1"], &[object(json!({"id": "fi1"}))]);
        assert!(cache.deep_del(
            CacheScope::FilterExp,
            "filterExp:fi1",
            CacheDelDirection::ChildToParent
        ));
        assert!(cache.get_list(CacheScope::FilterExp, &["fi9"]).is_none_list);
        assert!(cache.get_object("filterExp:fi1").is_none());
    }

    #[test]
    fn parent_to_child_removes_members_then_list() {
        let (cache, _) = cache_with_backend();
        cache.set_list(
            CacheScope::Column,
            &["md1"],
            &[object(json!({"id": "cl1"})), object(json!({"id": "cl2"}))],
        );
        assert!(cache.deep_del(
            CacheScope::Column,
            "column:md1:list",
            CacheDelDirection::ParentToChild
        ));
        assert!(cache.get_object("column:cl1").is_none());
        assert!(cache.get_object("column:cl2").is_none());
        assert!(cache.get_list(CacheScope::Column, &["md1"]).is_miss());
    }

    #[test]
    fn destroy_only_flushes_own_namespace() {
        let backend = InMemoryBackend::new();
        let ours = MetaCache::with_backend(Arc::new(backend.clone()), "nc");
        let theirs = MetaCache::with_backend(Arc::new(backend.clone()), "other");
        ours.set("view:vw1", &json!({"id": "vw1"}));
        theirs.set("view:vw1", &json!({"id": "vw1"}));

        assert!(ours.destroy());
        assert!(ours.export().is_empty());
        assert_eq!(theirs.export().len(), 1);
    }

    #[test]
    fn export_types_lists_as_arrays() {
        let (cache, _) = cache_with_backend();
        cache.set_list(CacheScope::Hook, &["md1"], &[object(json!({"id": "hk1"}))]);
        cache.set("hook:raw", &json!("not json"));
        let exported = cache.export();
        assert_eq!(exported["hook:md1:list"], json!(["hook:hk1"]));
        assert_eq!(exported["hook:hk1"], json!({"id": "hk1"}));
        assert_eq!(exported["hook:raw"], json!("not json"));
    }

    #[test]
    fn expiring_entries_vanish() {
        let (cache, _) = cache_with_backend();
        assert!(cache.set_expiring("singleQuery:md1:vw1", &json!({"rows": 1}), Duration::ZERO));
        assert!(cache.get_object("singleQuery:md1:vw1").is_none());
    }

    #[test]
    fn get_as_deserializes_typed_values() {
        #[derive(serde::Deserialize)]
        struct View {
            id: String,
        }
        let (cache, _) = cache_with_backend();
        assert!(cache.set_serialized("view:vw1", &json!({"id": "vw1"})));
        let view = cache.get_as::<View>("view:vw1").expect("typed read");
        assert_eq!(view.id, "vw1");
    }

    #[test]
    fn get_all_types_entries_by_key_shape() {
        let (cache, _) = cache_with_backend();
        cache.set_list(
            CacheScope::Column,
            &["md1"],
            &[object(json!({"id": "cl1", "title": "Status"}))],
        );
        cache.set("column:raw", &json!("plain"));
        cache.set("view:vw1", &json!({"id": "vw1"}));

        let columns = cache.get_all("column:*");
        assert_eq!(columns.len(), 3);
        assert_eq!(columns["column:md1:list"], json!(["column:cl1"]));
        assert_eq!(columns["column:cl1"], json!({"id": "cl1", "title": "Status"}));
        assert_eq!(columns["column:raw"], json!("plain"));
        assert!(cache.get_all("hook:*").is_empty());
        assert!(MetaCache::disabled().get_all("*").is_empty());
    }

    #[test]
    fn backend_failures_read_as_misses_and_no_ops() {
        let cache = MetaCache::with_backend(Arc::new(BrokenBackend), "nc");
        assert_eq!(cache.get("view:vw1", CacheGetType::Object), Value::Null);
        assert_eq!(cache.get("view:vw1:list", CacheGetType::Array), json!([]));
        assert!(cache.get_object("view:vw1").is_none());
        assert!(!cache.set("view:vw1", &json!({"id": "vw1"})));
        assert!(!cache.update("view:vw1", &object(json!({"title": "x"}))));
        assert!(!cache.del("view:vw1"));
        assert!(cache.get_list(CacheScope::View, &["md1"]).is_miss());
        assert!(!cache.set_list(CacheScope::View, &["md1"], &[object(json!({"id": "vw1"}))]));
        assert!(!cache.append_to_list(CacheScope::View, &["md1"], "view:vw1"));
        assert_eq!(cache.del_all(CacheScope::View, "*"), 0);
        assert!(cache.get_all("*").is_empty());
        assert!(cache.export().is_empty());
        assert!(!cache.deep_del(
            CacheScope::View,
            "view:md1:list",
            CacheDelDirection::ParentToChild
        ));
    }

    #[test]
    fn plain_value_under_list_key_is_never_surfaced() {
        let (cache, backend) = cache_with_backend();
        cache.set("filterExp:vw1:list", &json!("garbage"));
        assert!(!cache.append_to_list(CacheScope::FilterExp, &["vw1"], "filterExp:fi1"));
        assert!(cache.get_list(CacheScope::FilterExp, &["vw1"]).is_miss());
        assert!(!backend.exists("nc:filterExp:vw1:list").expect("exists"));

        cache.set("filterExp:vw2:list", &json!("garbage"));
        cache.set("filterExp:fi1", &json!({"id": "fi1"}));
        assert!(cache.deep_del(
            CacheScope::FilterExp,
            "filterExp:fi1",
            CacheDelDirection::ChildToParent
        ));
        assert!(cache.get_object("filterExp:fi1").is_none());
    }

    #[test]
    fn far_future_expiry_is_flushed_by_destroy() {
        let cache = MetaCache::with_backend(
            Arc::new(SqliteBackend::open_in_memory().expect("open")),
            "nc",
        );
        assert!(cache.set_expiring("view:vw1", &json!({"id": "vw1"}), Duration::MAX));
        assert_eq!(cache.export()["view:vw1"], json!({"id": "vw1"}));
        assert!(cache.destroy());
        assert!(cache.get_object("view:vw1").is_none());
        assert!(cache.export().is_empty());
    }
}
