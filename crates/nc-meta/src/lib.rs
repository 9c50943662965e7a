#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod memory;
pub mod sqlite;

pub use memory::{InMemoryMetaStore, MetaStats};
pub use sqlite::SqliteMetaStore;

/// A metadata row as stored: a flat JSON object.
pub type MetaRow = Map<String, Value>;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
    #[error("malformed metadata row: {0}")]
    InvalidRow(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaTable {
    Projects,
    Models,
    Columns,
    Views,
    Hooks,
    FilterExp,
}

impl MetaTable {
    pub const ALL: [MetaTable; 6] = [
        MetaTable::Projects,
        MetaTable::Models,
        MetaTable::Columns,
        MetaTable::Views,
        MetaTable::Hooks,
        MetaTable::FilterExp,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Projects => "nc_projects_v2",
            Self::Models => "nc_models_v2",
            Self::Columns => "nc_columns_v2",
            Self::Views => "nc_views_v2",
            Self::Hooks => "nc_hooks_v2",
            Self::FilterExp => "nc_filter_exp_v2",
        }
    }

    #[must_use]
    pub const fn id_prefix(self) -> &'static str {
        match self {
            Self::Projects => "p",
            Self::Models => "md",
            Self::Columns => "cl",
            Self::Views => "vw",
            Self::Hooks => "hk",
            Self::FilterExp => "fi",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|table| table.as_str() == name)
    }
}

impl fmt::Display for MetaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenant scope every store call runs under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetaContext {
    pub workspace_id: String,
    pub base_id: Option<String>,
}

impl MetaContext {
    #[must_use]
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            base_id: None,
        }
    }

    #[must_use]
    pub fn with_base(mut self, base_id: impl Into<String>) -> Self {
        self.base_id = Some(base_id.into());
        self
    }
}

/// Conjunction of field equalities. A `Null` expectation also matches a
/// missing field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Condition {
    fields: Vec<(String, Value)>,
}

impl Condition {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((field.into(), value.into()));
        self
    }

    #[must_use]
    pub fn where_null(self, field: impl Into<String>) -> Self {
        self.where_eq(field, Value::Null)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn matches(&self, row: &MetaRow) -> bool {
        self.fields.iter().all(|(field, expected)| match expected {
            Value::Null => row.get(field).is_none_or(Value::is_null),
            expected => row.get(field) == Some(expected),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListArgs {
    pub condition: Condition,
    /// When non-empty, a row must also match at least one of these.
    pub any_of: Vec<Condition>,
    pub order_by: Option<OrderBy>,
}

impl ListArgs {
    #[must_use]
    pub fn filtered(condition: Condition) -> Self {
        Self {
            condition,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    #[must_use]
    pub fn any_of(mut self, alternatives: Vec<Condition>) -> Self {
        self.any_of = alternatives;
        self
    }

    #[must_use]
    pub fn matches(&self, row: &MetaRow) -> bool {
        self.condition.matches(row)
            && (self.any_of.is_empty() || self.any_of.iter().any(|alt| alt.matches(row)))
    }
}

/// Generic accessor over the relational metadata store.
pub trait MetaStore: Send + Sync {
    fn meta_list(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        args: &ListArgs,
    ) -> Result<Vec<MetaRow>, MetaError>;

    /// Inserts `row`, assigning an id when it has none, and returns the
    /// stored row including timestamps.
    fn meta_insert(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        row: MetaRow,
    ) -> Result<MetaRow, MetaError>;

    /// Shallow-merges `patch` into the row; `None` when no such row exists.
    fn meta_update(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        id: &str,
        patch: &MetaRow,
    ) -> Result<Option<MetaRow>, MetaError>;

    fn meta_delete(&self, ctx: &MetaContext, table: MetaTable, id: &str) -> Result<bool, MetaError>;

    fn meta_get(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        id: &str,
    ) -> Result<Option<MetaRow>, MetaError> {
        self.meta_get_by(ctx, table, &Condition::new().where_eq("id", id))
    }

    fn meta_get_by(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        condition: &Condition,
    ) -> Result<Option<MetaRow>, MetaError> {
        Ok(self
            .meta_list(ctx, table, &ListArgs::filtered(condition.clone()))?
            .into_iter()
            .next())
    }

    /// `max(order) + 1` over the matching rows, `1` when there are none.
    fn meta_get_next_order(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        condition: &Condition,
    ) -> Result<f64, MetaError> {
        let rows = self.meta_list(ctx, table, &ListArgs::filtered(condition.clone()))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("order").and_then(Value::as_f64))
            .reduce(f64::max)
            .map_or(1.0, |max| max + 1.0))
    }

    fn meta_count(
        &self,
        ctx: &MetaContext,
        table: MetaTable,
        condition: &Condition,
    ) -> Result<usize, MetaError> {
        Ok(self
            .meta_list(ctx, table, &ListArgs::filtered(condition.clone()))?
            .len())
    }
}

/// Filters and sorts rows the way every store implementation must.
#[must_use]
pub fn apply_list_args(rows: impl IntoIterator<Item = MetaRow>, args: &ListArgs) -> Vec<MetaRow> {
    let mut rows = rows
        .into_iter()
        .filter(|row| args.matches(row))
        .collect::<Vec<_>>();
    if let Some(order_by) = &args.order_by {
        rows.sort_by(|a, b| {
            let ordering = compare_cells(a.get(&order_by.field), b.get(&order_by.field));
            match order_by.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        });
    }
    rows
}

/// Numbers before strings, `null`/missing last; stable otherwise.
fn compare_cells(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    let left = left.filter(|value| !value.is_null());
    let right = right.filter(|value| !value.is_null());
    match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.to_string().cmp(&b.to_string()),
        },
    }
}

#[must_use]
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `<prefix>_<unix ms hex><pid hex><sequence hex>`. The pid keeps ids apart
/// when several processes share one store.
#[must_use]
pub fn generate_id(table: MetaTable, sequence: u64) -> String {
    let millis = Utc::now().timestamp_millis().max(0);
    let pid = std::process::id() & 0xff_ffff;
    format!(
        "{}_{millis:x}{pid:06x}{:04x}",
        table.id_prefix(),
        sequence & 0xffff
    )
}

/// Ensures `row` has an id and stamps both timestamps.
pub(crate) fn prepare_insert(table: MetaTable, mut row: MetaRow, sequence: u64) -> MetaRow {
    let has_id = row
        .get("id")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.is_empty());
    if !has_id {
        row.insert("id".to_owned(), Value::String(generate_id(table, sequence)));
    }
    let now = Value::String(now_timestamp());
    row.insert("created_at".to_owned(), now.clone());
    row.insert("updated_at".to_owned(), now);
    row
}

pub(crate) fn apply_patch(row: &mut MetaRow, patch: &MetaRow) {
    for (field, value) in patch {
        if field != "id" {
            row.insert(field.clone(), value.clone());
        }
    }
    row.insert("updated_at".to_owned(), Value::String(now_timestamp()));
}

pub(crate) fn row_id(row: &MetaRow) -> Result<String, MetaError> {
    row.get("id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| MetaError::InvalidRow("row has no string id".to_owned()))
}
