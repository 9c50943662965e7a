#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("unknown cache scope: {0}")]
    UnknownScope(String),
    #[error("unknown cache deletion direction: {0}")]
    UnknownDirection(String),
    #[error("unknown cache get type: {0}")]
    UnknownGetType(String),
}

/// Entity family a cache key or list belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheScope {
    Project,
    Base,
    Model,
    Column,
    View,
    Hook,
    FilterExp,
    SingleQuery,
    UserProject,
    BaseUser,
}

impl CacheScope {
    pub const ALL: [CacheScope; 10] = [
        CacheScope::Project,
        CacheScope::Base,
        CacheScope::Model,
        CacheScope::Column,
        CacheScope::View,
        CacheScope::Hook,
        CacheScope::FilterExp,
        CacheScope::SingleQuery,
        CacheScope::UserProject,
        CacheScope::BaseUser,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Base => "base",
            Self::Model => "model",
            Self::Column => "column",
            Self::View => "view",
            Self::Hook => "hook",
            Self::FilterExp => "filterExp",
            Self::SingleQuery => "singleQuery",
            Self::UserProject => "userProject",
            Self::BaseUser => "baseUser",
        }
    }

    /// Members of these lists are keyed by entity id *and* role, since the
    /// same entity appears once per role.
    #[must_use]
    pub const fn is_role_scoped(self) -> bool {
        matches!(self, Self::UserProject | Self::BaseUser)
    }
}

impl fmt::Display for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheScope {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|scope| scope.as_str() == s)
            .ok_or_else(|| TypeError::UnknownScope(s.to_owned()))
    }
}

/// Shape a cached value is coerced into on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheGetType {
    Scalar,
    Array,
    Object,
}

impl FromStr for CacheGetType {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scalar" | "string" => Ok(Self::Scalar),
            "array" | "list" => Ok(Self::Array),
            "object" | "json" => Ok(Self::Object),
            other => Err(TypeError::UnknownGetType(other.to_owned())),
        }
    }
}

/// Direction of a cascading invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheDelDirection {
    /// Remove a child key from every list referencing it, then the child.
    ChildToParent,
    /// Remove every member of a list, then the list.
    ParentToChild,
}

impl CacheDelDirection {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChildToParent => "CHILD_TO_PARENT",
            Self::ParentToChild => "PARENT_TO_CHILD",
        }
    }
}

impl fmt::Display for CacheDelDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheDelDirection {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CHILD_TO_PARENT" | "child_to_parent" => Ok(Self::ChildToParent),
            "PARENT_TO_CHILD" | "parent_to_child" => Ok(Self::ParentToChild),
            other => Err(TypeError::UnknownDirection(other.to_owned())),
        }
    }
}

/// Declares a string-backed operator enum. Names outside the known set are
/// kept in `Other` so persisted rows with newer operators still load.
macro_rules! operator_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
            Other(String),
        }

        impl $name {
            #[must_use]
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $text,)+
                    Self::Other(text) => text,
                }
            }

            #[must_use]
            pub fn is_known(&self) -> bool {
                !matches!(self, Self::Other(_))
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                match value.as_str() {
                    $($text => Self::$variant,)+
                    _ => Self::Other(value),
                }
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::from(value.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                match value {
                    $name::Other(text) => text,
                    known => known.as_str().to_owned(),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

operator_enum! {
    /// How a rule folds into the running result of its sibling list.
    #[derive(Default)]
    LogicalOp {
        #[default]
        And => "and",
        Or => "or",
        Not => "not",
    }
}

operator_enum! {
    ComparisonOp {
        Eq => "eq",
        Neq => "neq",
        Not => "not",
        Like => "like",
        Nlike => "nlike",
        Empty => "empty",
        NotEmpty => "notempty",
        Null => "null",
        NotNull => "notnull",
        Checked => "checked",
        NotChecked => "notchecked",
        Blank => "blank",
        NotBlank => "notblank",
        AllOf => "allof",
        AnyOf => "anyof",
        NAllOf => "nallof",
        NAnyOf => "nanyof",
        Gt => "gt",
        Lt => "lt",
        Gte => "gte",
        Lte => "lte",
        Ge => "ge",
        Le => "le",
        In => "in",
        IsNot => "isnot",
        Is => "is",
        IsWithin => "isWithin",
        Btw => "btw",
        Nbtw => "nbtw",
    }
}

operator_enum! {
    /// Date-relative refinement of a comparison.
    ComparisonSubOp {
        Today => "today",
        Tomorrow => "tomorrow",
        Yesterday => "yesterday",
        OneWeekAgo => "oneWeekAgo",
        OneWeekFromNow => "oneWeekFromNow",
        OneMonthAgo => "oneMonthAgo",
        OneMonthFromNow => "oneMonthFromNow",
        DaysAgo => "daysAgo",
        DaysFromNow => "daysFromNow",
        ExactDate => "exactDate",
        PastWeek => "pastWeek",
        PastMonth => "pastMonth",
        PastYear => "pastYear",
        NextWeek => "nextWeek",
        NextMonth => "nextMonth",
        NextYear => "nextYear",
        PastNumberOfDays => "pastNumberOfDays",
        NextNumberOfDays => "nextNumberOfDays",
    }
}

impl ComparisonOp {
    #[must_use]
    pub fn is_null_or_empty_test(&self) -> bool {
        matches!(
            self,
            Self::Null | Self::NotNull | Self::Empty | Self::NotEmpty
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Bool,
    Number,
    Text,
}

/// A rule's comparison value, tagged once when the rule is loaded.
///
/// Serialized untagged so persisted rows keep their natural JSON shape
/// (`true`, `5`, `"Open"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FilterValue {
    /// Tags a raw JSON value. Arrays and objects are kept as their JSON text.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(v) => Some(Self::Bool(*v)),
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::String(s) => Some(Self::Text(s.clone())),
            other => Some(Self::Text(other.to_string())),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Number(_) => ValueKind::Number,
            Self::Text(_) => ValueKind::Text,
        }
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(v) => Value::Bool(*v),
            Self::Number(v) => number_to_json(*v),
            Self::Text(v) => Value::String(v.clone()),
        }
    }

    /// Textual form, integral numbers printed without a fraction.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Bool(v) => v.to_string(),
            Self::Number(v) => format_number(*v),
            Self::Text(v) => v.clone(),
        }
    }

    /// Truncates text values to at most `max_chars` characters.
    #[must_use]
    pub fn truncated(self, max_chars: usize) -> Self {
        match self {
            Self::Text(v) if v.chars().count() > max_chars => {
                Self::Text(v.chars().take(max_chars).collect())
            }
            other => other,
        }
    }
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<bool> for FilterValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for FilterValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

#[must_use]
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else if value.is_nan() {
        "NaN".to_owned()
    } else if value.is_infinite() {
        if value > 0.0 { "Infinity" } else { "-Infinity" }.to_owned()
    } else {
        value.to_string()
    }
}

fn number_to_json(value: f64) -> Value {
    if value.is_finite() && value == value.trunc() && value.abs() < 1e15 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        CacheDelDirection, CacheScope, ComparisonOp, FilterValue, LogicalOp, TypeError, ValueKind,
    };

    #[test]
    fn unknown_operators_survive_a_round_trip() {
        let op: ComparisonOp = serde_json::from_value(json!("isAfterSunset")).expect("parse");
        assert_eq!(op, ComparisonOp::Other("isAfterSunset".to_owned()));
        assert!(!op.is_known());
        assert_eq!(
            serde_json::to_value(&op).expect("serialize"),
            json!("isAfterSunset")
        );
    }

    #[test]
    fn camel_case_operator_names_parse() {
        assert_eq!(ComparisonOp::from("isWithin"), ComparisonOp::IsWithin);
        assert_eq!(LogicalOp::from("or"), LogicalOp::Or);
        assert_eq!(LogicalOp::default(), LogicalOp::And);
    }

    #[test]
    fn null_and_empty_tests_are_classified() {
        assert!(ComparisonOp::NotNull.is_null_or_empty_test());
        assert!(ComparisonOp::Empty.is_null_or_empty_test());
        assert!(!ComparisonOp::Blank.is_null_or_empty_test());
        assert!(!ComparisonOp::Other("null ".to_owned()).is_null_or_empty_test());
    }

    #[test]
    fn filter_value_is_tagged_from_json_type() {
        assert_eq!(FilterValue::from_json(&json!(true)).map(|v| v.kind()), Some(ValueKind::Bool));
        assert_eq!(FilterValue::from_json(&json!(5)).map(|v| v.kind()), Some(ValueKind::Number));
        assert_eq!(FilterValue::from_json(&json!("5")).map(|v| v.kind()), Some(ValueKind::Text));
        assert_eq!(FilterValue::from_json(&json!(null)), None);
    }

    #[test]
    fn integral_numbers_render_without_fraction() {
        assert_eq!(FilterValue::Number(3.0).to_text(), "3");
        assert_eq!(FilterValue::Number(2.5).to_text(), "2.5");
        assert_eq!(FilterValue::Number(3.0).to_json(), json!(3));
    }

    #[test]
    fn truncation_counts_characters() {
        let value = FilterValue::Text("äöüß".to_owned()).truncated(2);
        assert_eq!(value, FilterValue::Text("äö".to_owned()));
    }

    #[test]
    fn scope_and_direction_parse_from_names() {
        assert_eq!("filterExp".parse::<CacheScope>(), Ok(CacheScope::FilterExp));
        assert_eq!(
            "CHILD_TO_PARENT".parse::<CacheDelDirection>(),
            Ok(CacheDelDirection::ChildToParent)
        );
        assert_eq!(
            "SIDEWAYS".parse::<CacheDelDirection>(),
            Err(TypeError::UnknownDirection("SIDEWAYS".to_owned()))
        );
        assert!(CacheScope::BaseUser.is_role_scoped());
        assert!(!CacheScope::FilterExp.is_role_scoped());
    }
}
