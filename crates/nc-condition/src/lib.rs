#![forbid(unsafe_code)]

//! Flat rule evaluation against a single data row.
//!
//! Rules fold left to right into one accumulator; each rule's `logical_op`
//! says how its own result joins the running value. There is no operator
//! precedence and group nesting is not descended into.

use nc_types::{ComparisonOp, FilterValue, LogicalOp, ValueKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use unicode_casefold::UnicodeCaseFold;

mod operand;

use operand::{Operand, loose_eq};

/// One rule as seen by the evaluator: its column already resolved to the
/// row field title.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_op: Option<LogicalOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison_op: Option<ComparisonOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<FilterValue>,
}

impl ConditionRule {
    #[must_use]
    pub fn new(
        logical_op: LogicalOp,
        comparison_op: ComparisonOp,
        field: impl Into<String>,
        value: impl Into<FilterValue>,
    ) -> Self {
        Self {
            logical_op: Some(logical_op),
            comparison_op: Some(comparison_op),
            field: Some(field.into()),
            value: Some(value.into()),
        }
    }

    #[must_use]
    pub fn without_value(mut self) -> Self {
        self.value = None;
        self
    }
}

/// Evaluates `rules` against `row`. An empty rule list matches every row.
#[must_use]
pub fn validate_condition(rules: &[ConditionRule], row: &Map<String, Value>) -> bool {
    rules.iter().fold(true, |is_valid, rule| {
        let res = evaluate_rule(rule, row);
        match rule.logical_op.as_ref() {
            Some(LogicalOp::Or) => is_valid || res,
            Some(LogicalOp::Not) => is_valid && !res,
            _ => is_valid && res,
        }
    })
}

/// Result of a single rule. Operators without an entry in the dispatch
/// table are non-matching.
#[must_use]
pub fn evaluate_rule(rule: &ConditionRule, row: &Map<String, Value>) -> bool {
    let cell = Operand::from_cell(rule.field.as_deref().and_then(|field| row.get(field)));
    let expected = Operand::from_rule_value(rule.value.as_ref());
    let Some(op) = rule.comparison_op.as_ref() else {
        return false;
    };

    match op {
        ComparisonOp::Eq => loose_eq(&coerce_for(rule.value.as_ref(), &cell), &expected),
        ComparisonOp::Neq => !loose_eq(&coerce_for(rule.value.as_ref(), &cell), &expected),
        ComparisonOp::Like => contains_folded(&cell, rule.value.as_ref()) == Some(true),
        ComparisonOp::Nlike => contains_folded(&cell, rule.value.as_ref()) == Some(false),
        ComparisonOp::Empty | ComparisonOp::Blank => is_blank(&cell),
        ComparisonOp::NotEmpty | ComparisonOp::NotBlank => !is_blank(&cell),
        ComparisonOp::Checked => cell.is_truthy(),
        ComparisonOp::NotChecked => !cell.is_truthy(),
        ComparisonOp::Null => matches!(cell, Operand::Null),
        ComparisonOp::NotNull => !matches!(cell, Operand::Null),
        ComparisonOp::AllOf => all_of(&cell, rule.value.as_ref()),
        ComparisonOp::AnyOf => any_of(&cell, rule.value.as_ref()),
        ComparisonOp::NAllOf => !all_of(&cell, rule.value.as_ref()),
        ComparisonOp::NAnyOf => !any_of(&cell, rule.value.as_ref()),
        ComparisonOp::Lt => cell.to_number() < expected.to_number(),
        ComparisonOp::Lte | ComparisonOp::Le => cell.to_number() <= expected.to_number(),
        ComparisonOp::Gt => cell.to_number() > expected.to_number(),
        ComparisonOp::Gte | ComparisonOp::Ge => cell.to_number() >= expected.to_number(),
        _ => false,
    }
}

/// The row cell as compared for (in)equality, coerced by the rule value's
/// own type rather than the column's.
fn coerce_for<'a>(value: Option<&FilterValue>, cell: &Operand<'a>) -> Operand<'a> {
    match value.map(FilterValue::kind) {
        Some(ValueKind::Bool) => Operand::Bool(cell.is_truthy()),
        Some(ValueKind::Number) => Operand::Number(cell.to_number()),
        Some(ValueKind::Text) | None => cell.clone(),
    }
}

fn is_blank(cell: &Operand<'_>) -> bool {
    matches!(cell, Operand::Undefined | Operand::Null | Operand::Text(""))
}

fn fold_case(text: &str) -> String {
    text.chars().case_fold().collect()
}

/// Case-insensitive substring test. `None` when the cell is not text, which
/// neither `like` nor `nlike` accepts.
fn contains_folded(cell: &Operand<'_>, value: Option<&FilterValue>) -> Option<bool> {
    let Operand::Text(haystack) = cell else {
        return None;
    };
    let needle = match value {
        Some(value) => value.to_text(),
        None => return Some(false),
    };
    Some(fold_case(haystack).contains(&fold_case(&needle)))
}

/// Wanted items: the rule value split on `,` with each item trimmed.
fn wanted_items(value: Option<&FilterValue>) -> Vec<String> {
    match value {
        Some(FilterValue::Text(text)) => text
            .split(',')
            .map(|item| item.trim().to_owned())
            .collect(),
        Some(other) => vec![other.to_text().trim().to_owned()],
        None => Vec::new(),
    }
}

/// Present items: a text cell split on `,`, untrimmed.
fn present_items<'a>(cell: &Operand<'a>) -> Vec<&'a str> {
    match cell {
        Operand::Text(text) => text.split(',').collect(),
        _ => Vec::new(),
    }
}

fn all_of(cell: &Operand<'_>, value: Option<&FilterValue>) -> bool {
    let present = present_items(cell);
    wanted_items(value)
        .iter()
        .all(|item| present.contains(&item.as_str()))
}

fn any_of(cell: &Operand<'_>, value: Option<&FilterValue>) -> bool {
    let present = present_items(cell);
    wanted_items(value)
        .iter()
        .any(|item| present.contains(&item.as_str()))
}
