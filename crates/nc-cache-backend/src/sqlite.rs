use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::{BackendError, CacheBackend, StoredValue, is_expired, now_unix_ms};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    key        TEXT PRIMARY KEY NOT NULL,
    kind       TEXT NOT NULL CHECK (kind IN ('text', 'set')),
    value      TEXT NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS cache_entries_expires_at ON cache_entries (expires_at);
";

/// Backend fronting a shared SQLite database file.
///
/// Every process that opens the same file sees the same cache, which makes
/// this the multi-node deployment option.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, BackendError> {
        self.conn
            .lock()
            .map_err(|_| BackendError::LockPoisoned("sqlite cache connection"))
    }
}

fn encode(value: &StoredValue) -> Result<(&'static str, String), BackendError> {
    Ok(match value {
        StoredValue::Text(text) => ("text", text.clone()),
        StoredValue::Set(members) => ("set", serde_json::to_string(members)?),
    })
}

fn decode_row(kind: &str, value: String) -> Result<StoredValue, BackendError> {
    if kind == "set" {
        Ok(StoredValue::Set(serde_json::from_str::<BTreeSet<String>>(
            &value,
        )?))
    } else {
        Ok(StoredValue::Text(value))
    }
}

/// Deadlines past `i64::MAX` are stored as `i64::MAX`.
fn to_sql_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn from_sql_ms(ms: i64) -> u64 {
    u64::try_from(ms).unwrap_or(0)
}

/// Reads a live entry inside a transaction, purging it when expired.
fn read_live(tx: &Transaction<'_>, key: &str) -> Result<Option<StoredValue>, BackendError> {
    let row = tx
        .query_row(
            "SELECT kind, value, expires_at FROM cache_entries WHERE key = ?1",
            params![key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((_, _, expires_at)) if is_expired(expires_at.map(from_sql_ms), now_unix_ms()) => {
            tx.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
            Ok(None)
        }
        Some((kind, value, _)) => decode_row(&kind, value).map(Some),
    }
}

fn write(
    tx: &Transaction<'_>,
    key: &str,
    value: &StoredValue,
    expires_at_ms: Option<u64>,
) -> Result<(), BackendError> {
    let (kind, encoded) = encode(value)?;
    tx.execute(
        "INSERT INTO cache_entries (key, kind, value, expires_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET
           kind = excluded.kind, value = excluded.value, expires_at = excluded.expires_at",
        params![key, kind, encoded, expires_at_ms.map(to_sql_ms)],
    )?;
    Ok(())
}

impl CacheBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn get(&self, key: &str) -> Result<Option<StoredValue>, BackendError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = read_live(&tx, key)?;
        tx.commit()?;
        Ok(value)
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
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        write(&tx, key, &value, expires_at_ms)?;
        tx.commit()?;
        Ok(())
    }

    fn del(&self, keys: &[String]) -> Result<usize, BackendError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now_ms = to_sql_ms(now_unix_ms());
        let mut removed = 0;
        {
            let mut stmt = tx.prepare(
                "DELETE FROM cache_entries WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            )?;
            let mut purge = tx.prepare("DELETE FROM cache_entries WHERE key = ?1")?;
            for key in keys {
                removed += stmt.execute(params![key, now_ms])?;
                purge.execute(params![key])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn add_members(&self, key: &str, members: &[String]) -> Result<(), BackendError> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut set = match read_live(&tx, key)? {
            Some(StoredValue::Set(existing)) => existing,
            Some(other) => {
                return Err(BackendError::WrongType {
                    key: key.to_owned(),
                    found: other.kind_name(),
                });
            }
            None => BTreeSet::new(),
        };
        set.extend(members.iter().cloned());
        write(&tx, key, &StoredValue::Set(set), None)?;
        tx.commit()?;
        Ok(())
    }

    fn remove_member(&self, key: &str, member: &str) -> Result<bool, BackendError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let removed = match read_live(&tx, key)? {
            Some(StoredValue::Set(mut existing)) => {
                let removed = existing.remove(member);
                if existing.is_empty() {
                    tx.execute("DELETE FROM cache_entries WHERE key = ?1", params![key])?;
                } else if removed {
                    tx.execute(
                        "UPDATE cache_entries SET value = ?2 WHERE key = ?1",
                        params![key, serde_json::to_string(&existing)?],
                    )?;
                }
                removed
            }
            Some(other) => {
                return Err(BackendError::WrongType {
                    key: key.to_owned(),
                    found: other.kind_name(),
                });
            }
            None => false,
        };
        tx.commit()?;
        Ok(removed)
    }

    fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, BackendError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key FROM cache_entries
             WHERE key GLOB ?1 AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY key",
        )?;
        let keys = stmt
            .query_map(params![pattern, to_sql_ms(now_unix_ms())], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn export_all(&self) -> Result<BTreeMap<String, StoredValue>, BackendError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key, kind, value FROM cache_entries
             WHERE expires_at IS NULL OR expires_at > ?1",
        )?;
        let rows = stmt
            .query_map(params![to_sql_ms(now_unix_ms())], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, kind, value)| Ok((key, decode_row(&kind, value)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::SqliteBackend;
    use crate::{CacheBackend, StoredValue, now_unix_ms};

    #[test]
    fn sets_round_trip_through_json_columns() {
        let backend = SqliteBackend::open_in_memory().expect("open");
        backend
            .add_members(
                "nc:filterExp:vw1:list",
                &["filterExp:fi1".to_owned(), "filterExp:fi2".to_owned()],
            )
            .expect("sadd");
        assert_eq!(
            backend.get("nc:filterExp:vw1:list").expect("get"),
            Some(StoredValue::Set(BTreeSet::from([
                "filterExp:fi1".to_owned(),
                "filterExp:fi2".to_owned()
            ])))
        );
    }

    #[test]
    fn glob_matching_uses_sqlite_glob() {
        let backend = SqliteBackend::open_in_memory().expect("open");
        for key in ["nc:view:vw1", "nc:view:vw1:list", "nc:column:cl1"] {
            backend
                .set(key, StoredValue::Text("{}".to_owned()), None)
                .expect("set");
        }
        assert_eq!(
            backend.keys_matching("nc:view:*").expect("keys"),
            vec!["nc:view:vw1".to_owned(), "nc:view:vw1:list".to_owned()]
        );
    }

    #[test]
    fn expired_rows_are_purged_on_read() {
        let backend = SqliteBackend::open_in_memory().expect("open");
        backend
            .set(
                "nc:singleQuery:md1:vw1",
                StoredValue::Text("cached".to_owned()),
                Some(now_unix_ms().saturating_sub(10)),
            )
            .expect("set");
        assert_eq!(backend.get("nc:singleQuery:md1:vw1").expect("get"), None);
        assert_eq!(
            backend
                .del(&["nc:singleQuery:md1:vw1".to_owned()])
                .expect("del"),
            0
        );
    }

    #[test]
    fn far_future_deadlines_stay_live_for_every_query() {
        let backend = SqliteBackend::open_in_memory().expect("open");
        backend
            .set("nc:view:vw1", StoredValue::Text("{}".to_owned()), Some(u64::MAX))
            .expect("set");
        assert!(backend.get("nc:view:vw1").expect("get").is_some());
        assert_eq!(
            backend.keys_matching("nc:view:*").expect("keys"),
            vec!["nc:view:vw1".to_owned()]
        );
        assert!(backend.export_all().expect("export").contains_key("nc:view:vw1"));
        assert_eq!(backend.del(&["nc:view:vw1".to_owned()]).expect("del"), 1);
        assert_eq!(backend.get("nc:view:vw1").expect("get"), None);
    }

    #[test]
    fn file_backed_stores_are_shared_between_handles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.sqlite");
        let writer = SqliteBackend::open(&path).expect("open writer");
        let reader = SqliteBackend::open(&path).expect("open reader");

        writer
            .set("nc:project:p1", StoredValue::Text("{\"id\":\"p1\"}".to_owned()), None)
            .expect("set");
        assert!(reader.exists("nc:project:p1").expect("exists"));
        assert_eq!(reader.path(), Some(path.as_path()));
    }
}
