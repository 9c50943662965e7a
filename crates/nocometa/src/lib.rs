#![forbid(unsafe_code)]

//! Facade over the nocometa crates.

pub use nc_cache::{CacheBackendKind, CacheConfig, CacheError, CachedList, ListOptions, MetaCache};
pub use nc_cache_backend::{CacheBackend, InMemoryBackend, SqliteBackend};
pub use nc_condition::{ConditionRule, validate_condition};
pub use nc_filter::{
    Filter, FilterDraft, FilterError, FilterObject, FilterOwner, FilterPatch, FilterRepository,
    ParentRef,
};
pub use nc_meta::{InMemoryMetaStore, MetaContext, MetaStore, MetaTable, SqliteMetaStore};
pub use nc_types::{
    CacheDelDirection, CacheGetType, CacheScope, ComparisonOp, ComparisonSubOp, FilterValue,
    LogicalOp,
};

pub mod cache {
    pub use nc_cache::*;
}

pub mod backend {
    pub use nc_cache_backend::*;
}

pub mod meta {
    pub use nc_meta::*;
}

pub mod filter {
    pub use nc_filter::*;
}

pub mod condition {
    pub use nc_condition::*;
}

pub mod types {
    pub use nc_types::*;
}
