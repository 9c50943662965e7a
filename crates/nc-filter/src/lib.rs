#![forbid(unsafe_code)]

//! Filter rule trees.
//!
//! Filters hang off a view or a webhook and nest through `fk_parent_id`.
//! They are persisted as flat rows in the metadata store, cached per node
//! and per owner/parent list in a [`nc_cache::MetaCache`], and rebuilt into
//! a tree on read.

pub mod model;
pub mod repository;

pub use model::{
    Filter, FilterDraft, FilterObject, FilterOwner, FilterPatch, MAX_VALUE_CHARS, ParentRef,
    filter_key,
};
pub use repository::FilterRepository;

use nc_meta::MetaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("a filter must belong to exactly one view or hook")]
    InvalidOwner,
    #[error("{kind} '{id}' not found")]
    OwnerNotFound { kind: &'static str, id: String },
    #[error("column '{0}' not found")]
    DanglingColumn(String),
    #[error("filter '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error("malformed filter row: {0}")]
    Row(#[from] serde_json::Error),
}

impl FilterError {
    /// Errors caused by the request rather than by the store.
    #[must_use]
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            Self::InvalidOwner | Self::OwnerNotFound { .. } | Self::DanglingColumn(_)
        )
    }
}
