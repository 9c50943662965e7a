use nc_meta::MetaRow;
use nc_types::{CacheScope, ComparisonOp, ComparisonSubOp, FilterValue, LogicalOp};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::FilterError;

/// Longest text value a patch may store.
pub const MAX_VALUE_CHARS: usize = 255;

/// One node of a filter tree, as persisted in `nc_filter_exp_v2`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fk_view_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fk_hook_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fk_column_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fk_parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison_op: Option<ComparisonOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison_sub_op: Option<ComparisonSubOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<FilterValue>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_op: Option<LogicalOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Populated only on reconstructed trees; never persisted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Filter>,
}

impl Filter {
    pub fn from_row(row: MetaRow) -> Result<Self, FilterError> {
        Ok(serde_json::from_value(Value::Object(row))?)
    }

    /// The flat row form, without reconstructed children.
    pub fn to_row(&self) -> Result<MetaRow, FilterError> {
        match serde_json::to_value(self)? {
            Value::Object(mut row) => {
                row.remove("children");
                Ok(row)
            }
            _ => Ok(MetaRow::new()),
        }
    }

    #[must_use]
    pub fn owner(&self) -> Option<FilterOwner> {
        FilterOwner::from_ids(self.fk_view_id.as_deref(), self.fk_hook_id.as_deref()).ok()
    }

    #[must_use]
    pub fn cache_key(&self) -> String {
        filter_key(&self.id)
    }

    /// A node naming itself as its parent; never descended into.
    #[must_use]
    pub fn is_self_parented(&self) -> bool {
        self.fk_parent_id.as_deref() == Some(self.id.as_str())
    }
}

#[must_use]
pub fn filter_key(id: &str) -> String {
    nc_cache::entity_key(CacheScope::FilterExp, id)
}

/// The view or hook a filter tree hangs off.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum FilterOwner {
    View(String),
    Hook(String),
}

impl FilterOwner {
    pub fn from_ids(view_id: Option<&str>, hook_id: Option<&str>) -> Result<Self, FilterError> {
        let present = |id: Option<&str>| id.filter(|id| !id.is_empty()).map(str::to_owned);
        match (present(view_id), present(hook_id)) {
            (Some(view), None) => Ok(Self::View(view)),
            (None, Some(hook)) => Ok(Self::Hook(hook)),
            _ => Err(FilterError::InvalidOwner),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::View(id) | Self::Hook(id) => id,
        }
    }

    /// Column of the filter row pointing at this owner.
    #[must_use]
    pub fn column(&self) -> &'static str {
        match self {
            Self::View(_) => "fk_view_id",
            Self::Hook(_) => "fk_hook_id",
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::View(_) => "view",
            Self::Hook(_) => "hook",
        }
    }
}

/// Input to `FilterRepository::insert`. Children are inserted beneath the
/// new node with the same owner.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FilterDraft {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub fk_view_id: Option<String>,
    #[serde(default)]
    pub fk_hook_id: Option<String>,
    #[serde(default)]
    pub fk_column_id: Option<String>,
    #[serde(default)]
    pub fk_parent_id: Option<String>,
    #[serde(default)]
    pub comparison_op: Option<ComparisonOp>,
    #[serde(default)]
    pub comparison_sub_op: Option<ComparisonSubOp>,
    #[serde(default)]
    pub value: Option<FilterValue>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_group: bool,
    #[serde(default)]
    pub logical_op: Option<LogicalOp>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub base_id: Option<String>,
    #[serde(default)]
    pub children: Vec<FilterDraft>,
}

impl FilterDraft {
    #[must_use]
    pub fn for_owner(owner: &FilterOwner) -> Self {
        let mut draft = Self::default();
        match owner {
            FilterOwner::View(id) => draft.fk_view_id = Some(id.clone()),
            FilterOwner::Hook(id) => draft.fk_hook_id = Some(id.clone()),
        }
        draft
    }

    #[must_use]
    pub fn leaf(
        owner: &FilterOwner,
        column_id: &str,
        comparison_op: ComparisonOp,
        value: impl Into<FilterValue>,
    ) -> Self {
        Self {
            fk_column_id: Some(column_id.to_owned()),
            comparison_op: Some(comparison_op),
            value: Some(value.into()),
            logical_op: Some(LogicalOp::And),
            ..Self::for_owner(owner)
        }
    }

    #[must_use]
    pub fn group(owner: &FilterOwner, logical_op: LogicalOp, children: Vec<FilterDraft>) -> Self {
        Self {
            is_group: true,
            logical_op: Some(logical_op),
            children,
            ..Self::for_owner(owner)
        }
    }

    pub fn owner(&self) -> Result<FilterOwner, FilterError> {
        FilterOwner::from_ids(self.fk_view_id.as_deref(), self.fk_hook_id.as_deref())
    }
}

/// Partial update of a filter's rule fields. Owner and ancestry fields are
/// not patchable. Nested options distinguish "clear" from "leave alone".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterPatch {
    pub fk_column_id: Option<Option<String>>,
    pub comparison_op: Option<ComparisonOp>,
    pub comparison_sub_op: Option<Option<ComparisonSubOp>>,
    pub value: Option<Option<FilterValue>>,
    pub fk_parent_id: Option<Option<String>>,
    pub is_group: Option<bool>,
    pub logical_op: Option<LogicalOp>,
}

impl FilterPatch {
    #[must_use]
    pub fn logical_op(op: LogicalOp) -> Self {
        Self {
            logical_op: Some(op),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Row fields to merge; text values cut to `MAX_VALUE_CHARS`.
    #[must_use]
    pub fn to_row(&self) -> MetaRow {
        fn optional(value: Option<Value>) -> Value {
            value.unwrap_or(Value::Null)
        }

        let mut row = MetaRow::new();
        if let Some(column) = &self.fk_column_id {
            row.insert(
                "fk_column_id".to_owned(),
                optional(column.clone().map(Value::String)),
            );
        }
        if let Some(op) = &self.comparison_op {
            row.insert("comparison_op".to_owned(), Value::String(op.to_string()));
        }
        if let Some(sub_op) = &self.comparison_sub_op {
            row.insert(
                "comparison_sub_op".to_owned(),
                optional(sub_op.as_ref().map(|op| Value::String(op.to_string()))),
            );
        }
        if let Some(value) = &self.value {
            row.insert(
                "value".to_owned(),
                optional(
                    value
                        .clone()
                        .map(|value| value.truncated(MAX_VALUE_CHARS).to_json()),
                ),
            );
        }
        if let Some(parent) = &self.fk_parent_id {
            row.insert(
                "fk_parent_id".to_owned(),
                optional(parent.clone().map(Value::String)),
            );
        }
        if let Some(is_group) = self.is_group {
            row.insert("is_group".to_owned(), Value::Bool(is_group));
        }
        if let Some(op) = &self.logical_op {
            row.insert("logical_op".to_owned(), Value::String(op.to_string()));
        }
        row
    }
}

/// Reconstructed tree for one owner, rooted at an implicit `and` group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterObject {
    pub is_group: bool,
    pub logical_op: LogicalOp,
    pub children: Vec<Filter>,
}

impl Default for FilterObject {
    fn default() -> Self {
        Self {
            is_group: true,
            logical_op: LogicalOp::And,
            children: Vec::new(),
        }
    }
}

/// Whose children `update_all_children_logical_op` rewrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentRef {
    /// Top-level filters of the view.
    Root,
    Group(String),
}

impl ParentRef {
    /// `"root"` selects the top level, anything else a group id.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw == "root" {
            Self::Root
        } else {
            Self::Group(raw.to_owned())
        }
    }
}

/// Accepts `true/false`, `0/1` and their string forms; relational stores
/// persist booleans as integers.
fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(false),
        Value::Bool(flag) => Ok(flag),
        Value::Number(number) => Ok(number.as_f64().is_some_and(|n| n != 0.0)),
        Value::String(text) => match text.trim() {
            "true" | "1" => Ok(true),
            "false" | "0" | "" => Ok(false),
            other => Err(D::Error::custom(format!("invalid boolean {other:?}"))),
        },
        other => Err(D::Error::custom(format!("invalid boolean {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use nc_types::{ComparisonOp, FilterValue, LogicalOp};
    use serde_json::json;

    use super::{Filter, FilterDraft, FilterOwner, FilterPatch, ParentRef};
    use crate::FilterError;

    #[test]
    fn is_group_reads_integers_and_strings() {
        for (raw, expected) in [
            (json!(1), true),
            (json!(0), false),
            (json!("true"), true),
            (json!("0"), false),
            (json!(null), false),
        ] {
            let filter: Filter =
                serde_json::from_value(json!({"id": "fi1", "is_group": raw})).expect("parse");
            assert_eq!(filter.is_group, expected);
        }
        assert!(serde_json::from_value::<Filter>(json!({"is_group": "maybe"})).is_err());
    }

    #[test]
    fn rows_keep_unknown_operators() {
        let filter: Filter = serde_json::from_value(json!({
            "id": "fi1",
            "fk_view_id": "vw1",
            "comparison_op": "isAfterSunset",
            "value": "3",
            "order": 2
        }))
        .expect("parse");
        assert_eq!(
            filter.comparison_op,
            Some(ComparisonOp::Other("isAfterSunset".to_owned()))
        );
        let row = filter.to_row().expect("row");
        assert_eq!(row["comparison_op"], json!("isAfterSunset"));
        assert!(!row.contains_key("children"));
        assert_eq!(filter.owner(), Some(FilterOwner::View("vw1".to_owned())));
    }

    #[test]
    fn owner_must_be_exactly_one_of_view_or_hook() {
        assert!(matches!(
            FilterOwner::from_ids(None, None),
            Err(FilterError::InvalidOwner)
        ));
        assert!(matches!(
            FilterOwner::from_ids(Some("vw1"), Some("hk1")),
            Err(FilterError::InvalidOwner)
        ));
        assert_eq!(
            FilterOwner::from_ids(Some(""), Some("hk1")).expect("hook"),
            FilterOwner::Hook("hk1".to_owned())
        );
    }

    #[test]
    fn patch_truncates_text_and_encodes_clears() {
        let patch = FilterPatch {
            value: Some(Some(FilterValue::Text("x".repeat(300)))),
            fk_parent_id: Some(None),
            logical_op: Some(LogicalOp::Or),
            ..FilterPatch::default()
        };
        let row = patch.to_row();
        assert_eq!(row["value"].as_str().map(str::len), Some(255));
        assert_eq!(row["fk_parent_id"], json!(null));
        assert_eq!(row["logical_op"], json!("or"));
        assert!(!row.contains_key("comparison_op"));
        assert!(FilterPatch::default().is_empty());
    }

    #[test]
    fn drafts_deserialize_with_nested_children() {
        let draft: FilterDraft = serde_json::from_value(json!({
            "fk_view_id": "vw1",
            "is_group": 1,
            "logical_op": "or",
            "children": [{"fk_view_id": "vw1", "comparison_op": "eq", "value": "Open"}]
        }))
        .expect("parse");
        assert!(draft.is_group);
        assert_eq!(draft.children.len(), 1);
        assert_eq!(ParentRef::parse("root"), ParentRef::Root);
        assert_eq!(ParentRef::parse("fi1"), ParentRef::Group("fi1".to_owned()));
    }
}
