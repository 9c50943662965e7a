use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{BackendError, CacheBackend, GlobPattern, StoredValue, is_expired, now_unix_ms};

#[derive(Debug, Clone)]
struct Entry {
    value: StoredValue,
    expires_at_ms: Option<u64>,
}

/// Process-local backend for single-node deployments and tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    entries: Arc<Mutex<BTreeMap<String, Entry>>>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Entry>>, BackendError> {
        self.entries
            .lock()
            .map_err(|_| BackendError::LockPoisoned("in-memory cache"))
    }
}

/// Drops `key` if its deadline has passed and returns the live entry.
fn live_entry<'a>(
    entries: &'a mut BTreeMap<String, Entry>,
    key: &str,
    now_ms: u64,
) -> Option<&'a mut Entry> {
    if entries
        .get(key)
        .is_some_and(|entry| is_expired(entry.expires_at_ms, now_ms))
    {
        entries.remove(key);
    }
    entries.get_mut(key)
}

impl CacheBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<StoredValue>, BackendError> {
        let mut guard = self.lock()?;
        Ok(live_entry(&mut guard, key, now_unix_ms()).map(|entry| entry.value.clone()))
    }

    fn set(
        &self,
        key: &str,
        value: StoredValue,
        expires_at_ms: Option<u64>,
    ) -> Result<(), BackendError> {
        if value.is_empty_set() {
            return Ok(());
        }
        let mut guard = self.lock()?;
        guard.insert(
            key.to_owned(),
            Entry {
                value,
                expires_at_ms,
            },
        );
        Ok(())
    }

    fn del(&self, keys: &[String]) -> Result<usize, BackendError> {
        let mut guard = self.lock()?;
        let now_ms = now_unix_ms();
        Ok(keys
            .iter()
            .filter_map(|key| guard.remove(key))
            .filter(|entry| !is_expired(entry.expires_at_ms, now_ms))
            .count())
    }

    fn add_members(&self, key: &str, members: &[String]) -> Result<(), BackendError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut guard = self.lock()?;
        match live_entry(&mut guard, key, now_unix_ms()) {
            Some(Entry {
                value: StoredValue::Set(existing),
                ..
            }) => {
                existing.extend(members.iter().cloned());
                Ok(())
            }
            Some(entry) => Err(BackendError::WrongType {
                key: key.to_owned(),
                found: entry.value.kind_name(),
            }),
            None => {
                guard.insert(
                    key.to_owned(),
                    Entry {
                        value: StoredValue::Set(members.iter().cloned().collect::<BTreeSet<_>>()),
                        expires_at_ms: None,
                    },
                );
                Ok(())
            }
        }
    }

    fn remove_member(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        let mut guard = self.lock()?;
        let (removed, now_empty) = match live_entry(&mut guard, key, now_unix_ms()) {
            Some(Entry {
                value: StoredValue::Set(existing),
                ..
            }) => (existing.remove(member), existing.is_empty()),
            Some(entry) => {
                return Err(BackendError::WrongType {
                    key: key.to_owned(),
                    found: entry.value.kind_name(),
                });
            }
            None => (false, false),
        };
        if now_empty {
            guard.remove(key);
        }
        Ok(removed)
    }

    fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let glob = GlobPattern::new(pattern)?;
        let guard = self.lock()?;
        let now_ms = now_unix_ms();
        Ok(guard
            .iter()
            .filter(|(key, entry)| !is_expired(entry.expires_at_ms, now_ms) && glob.matches(key))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn export_all(&self) -> Result<BTreeMap<String, StoredValue>, BackendError> {
        let guard = self.lock()?;
        let now_ms = now_unix_ms();
        Ok(guard
            .iter()
            .filter(|(_, entry)| !is_expired(entry.expires_at_ms, now_ms))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::InMemoryBackend;
    use crate::{BackendError, CacheBackend, StoredValue, now_unix_ms};

    fn set_of(items: &[&str]) -> StoredValue {
        StoredValue::Set(items.iter().map(|item| (*item).to_owned()).collect::<BTreeSet<_>>())
    }

    #[test]
    fn removing_last_member_drops_the_key() {
        let backend = InMemoryBackend::new();
        backend
            .add_members("nc:filterExp:vw1:list", &["filterExp:fi1".to_owned()])
            .expect("sadd");
        assert!(
            backend
                .remove_member("nc:filterExp:vw1:list", "filterExp:fi1")
                .expect("srem")
        );
        assert!(!backend.exists("nc:filterExp:vw1:list").expect("exists"));
    }

    #[test]
    fn empty_set_writes_are_ignored() {
        let backend = InMemoryBackend::new();
        backend.set("k", set_of(&[]), None).expect("set");
        assert_eq!(backend.get("k").expect("get"), None);
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let backend = InMemoryBackend::new();
        backend
            .set("k", StoredValue::Text("v".to_owned()), Some(now_unix_ms() - 1))
            .expect("set");
        assert_eq!(backend.get("k").expect("get"), None);
        assert!(backend.keys_matching("*").expect("keys").is_empty());
    }

    #[test]
    fn set_ops_reject_text_values() {
        let backend = InMemoryBackend::new();
        backend
            .set("k", StoredValue::Text("v".to_owned()), None)
            .expect("set");
        let err = backend
            .add_members("k", &["m".to_owned()])
            .expect_err("wrong type");
        assert!(matches!(err, BackendError::WrongType { found: "text", .. }));
    }

    #[test]
    fn clones_share_storage() {
        let backend = InMemoryBackend::new();
        let other = backend.clone();
        backend
            .set("k", StoredValue::Text("v".to_owned()), None)
            .expect("set");
        assert_eq!(
            other.get("k").expect("get"),
            Some(StoredValue::Text("v".to_owned()))
        );
        assert_eq!(other.export_all().expect("export").len(), 1);
        assert_eq!(backend.del(&["k".to_owned(), "missing".to_owned()]).expect("del"), 1);
    }
}
