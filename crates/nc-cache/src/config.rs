use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_DISABLE_CACHE: &str = "NC_DISABLE_CACHE";
pub const ENV_CACHE_BACKEND: &str = "NC_CACHE_BACKEND";
pub const ENV_CACHE_PATH: &str = "NC_CACHE_PATH";
pub const ENV_CACHE_NAMESPACE: &str = "NC_CACHE_NAMESPACE";

pub const DEFAULT_NAMESPACE: &str = "nc";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown cache backend {0:?} (expected `memory` or `sqlite`)")]
    UnknownBackend(String),
    #[error("NC_CACHE_PATH must be set when the sqlite cache backend is selected")]
    MissingPath,
    #[error("{name} has an invalid boolean value {value:?}")]
    InvalidFlag { name: &'static str, value: String },
    #[error("cache namespace must not be empty")]
    EmptyNamespace,
}

/// Which physical store backs the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheBackendKind {
    #[default]
    InMemory,
    /// A SQLite file shared by every process pointing at the same path.
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub disabled: bool,
    pub namespace: String,
    pub backend: CacheBackendKind,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            namespace: DEFAULT_NAMESPACE.to_owned(),
            backend: CacheBackendKind::InMemory,
        }
    }
}

impl CacheConfig {
    /// Reads the cache settings from the process environment.
    ///
    /// - NC_DISABLE_CACHE: `true`/`1` turns every cache operation into a no-op
    /// - NC_CACHE_BACKEND: `memory` (default) or `sqlite`
    /// - NC_CACHE_PATH: database file for the sqlite backend
    /// - NC_CACHE_NAMESPACE: key prefix (default `nc`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let disabled = match lookup(ENV_DISABLE_CACHE) {
            None => false,
            Some(raw) => parse_flag(ENV_DISABLE_CACHE, &raw)?,
        };

        let namespace = match lookup(ENV_CACHE_NAMESPACE) {
            None => DEFAULT_NAMESPACE.to_owned(),
            Some(raw) if raw.trim().is_empty() => return Err(ConfigError::EmptyNamespace),
            Some(raw) => raw.trim().to_owned(),
        };

        let backend = match lookup(ENV_CACHE_BACKEND)
            .map(|raw| raw.trim().to_ascii_lowercase())
            .as_deref()
        {
            None | Some("") | Some("memory") | Some("in_memory") => CacheBackendKind::InMemory,
            Some("sqlite") => {
                let path = lookup(ENV_CACHE_PATH)
                    .filter(|raw| !raw.trim().is_empty())
                    .ok_or(ConfigError::MissingPath)?;
                CacheBackendKind::Sqlite {
                    path: PathBuf::from(path),
                }
            }
            Some(other) => return Err(ConfigError::UnknownBackend(other.to_owned())),
        };

        Ok(Self {
            disabled,
            namespace,
            backend,
        })
    }
}

fn parse_flag(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            name,
            value: raw.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use super::{CacheBackendKind, CacheConfig, ConfigError};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<BTreeMap<_, _>>();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = CacheConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.namespace, "nc");
    }

    #[test]
    fn sqlite_backend_requires_a_path() {
        let err = CacheConfig::from_lookup(lookup(&[("NC_CACHE_BACKEND", "sqlite")]))
            .expect_err("path missing");
        assert_eq!(err, ConfigError::MissingPath);

        let config = CacheConfig::from_lookup(lookup(&[
            ("NC_CACHE_BACKEND", "SQLite"),
            ("NC_CACHE_PATH", "/var/lib/nc/cache.db"),
            ("NC_DISABLE_CACHE", "1"),
        ]))
        .expect("config");
        assert!(config.disabled);
        assert_eq!(
            config.backend,
            CacheBackendKind::Sqlite {
                path: PathBuf::from("/var/lib/nc/cache.db")
            }
        );
    }

    #[test]
    fn unknown_backend_and_bad_flags_are_rejected() {
        assert_eq!(
            CacheConfig::from_lookup(lookup(&[("NC_CACHE_BACKEND", "redis")])),
            Err(ConfigError::UnknownBackend("redis".to_owned()))
        );
        assert!(matches!(
            CacheConfig::from_lookup(lookup(&[("NC_DISABLE_CACHE", "maybe")])),
            Err(ConfigError::InvalidFlag { .. })
        ));
    }

    #[test]
    fn config_deserializes_with_partial_fields() {
        let config: CacheConfig = serde_json::from_str(
            r#"{"backend": {"kind": "sqlite", "path": "cache.db"}}"#,
        )
        .expect("deserialize");
        assert_eq!(config.namespace, "nc");
        assert!(!config.disabled);
        assert!(matches!(config.backend, CacheBackendKind::Sqlite { .. }));
    }
}
