//! Row cells and rule values under JavaScript coercion rules.
//!
//! Rows arrive as JSON and rule values have historically been compared with
//! loose (`==`) equality and unary-plus number conversion, so the evaluator
//! reproduces those conversions exactly.

use nc_types::FilterValue;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand<'a> {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Text(&'a str),
    /// Arrays and objects, kept as JSON.
    Compound(&'a Value),
}

impl<'a> Operand<'a> {
    pub(crate) fn from_cell(cell: Option<&'a Value>) -> Self {
        match cell {
            None => Self::Undefined,
            Some(Value::Null) => Self::Null,
            Some(Value::Bool(b)) => Self::Bool(*b),
            Some(Value::Number(n)) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            Some(Value::String(s)) => Self::Text(s),
            Some(compound) => Self::Compound(compound),
        }
    }

    pub(crate) fn from_rule_value(value: Option<&'a FilterValue>) -> Self {
        match value {
            None => Self::Null,
            Some(FilterValue::Bool(b)) => Self::Bool(*b),
            Some(FilterValue::Number(n)) => Self::Number(*n),
            Some(FilterValue::Text(s)) => Self::Text(s),
        }
    }

    pub(crate) fn is_truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(b) => *b,
            Self::Number(n) => *n != 0.0 && !n.is_nan(),
            Self::Text(s) => !s.is_empty(),
            Self::Compound(_) => true,
        }
    }

    /// Unary `+`.
    pub(crate) fn to_number(&self) -> f64 {
        match self {
            Self::Undefined => f64::NAN,
            Self::Null => 0.0,
            Self::Bool(b) => f64::from(u8::from(*b)),
            Self::Number(n) => *n,
            Self::Text(s) => string_to_number(s),
            Self::Compound(value) if value.is_array() => string_to_number(&js_string(value)),
            Self::Compound(_) => f64::NAN,
        }
    }

    fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }
}

/// Loose equality (`==`) between two operands.
pub(crate) fn loose_eq(left: &Operand<'_>, right: &Operand<'_>) -> bool {
    use Operand::{Bool, Compound, Number, Text};

    if left.is_nullish() || right.is_nullish() {
        return left.is_nullish() && right.is_nullish();
    }
    match (left, right) {
        (Number(a), Number(b)) => a == b,
        (Text(a), Text(b)) => a == b,
        (Bool(a), Bool(b)) => a == b,
        (Compound(a), Compound(b)) => std::ptr::eq(*a, *b),
        (Bool(_), other) => loose_eq(&Number(left.to_number()), other),
        (other, Bool(_)) => loose_eq(other, &Number(right.to_number())),
        (Number(a), Text(_)) => *a == right.to_number(),
        (Text(_), Number(b)) => left.to_number() == *b,
        (Compound(value), other) => loose_eq(&Operand::Text(&js_string(value)), other),
        (other, Compound(value)) => loose_eq(other, &Operand::Text(&js_string(value))),
        _ => false,
    }
}

/// `Number(text)`: surrounding whitespace ignored, empty text is zero,
/// radix prefixes and `Infinity` accepted, anything else malformed is NaN.
pub(crate) fn string_to_number(text: &str) -> f64 {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    for (prefix, radix) in [("0x", 16), ("0X", 16), ("0o", 8), ("0O", 8), ("0b", 2), ("0B", 2)] {
        if let Some(digits) = trimmed.strip_prefix(prefix) {
            return radix_to_number(digits, radix);
        }
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    let well_formed = trimmed
        .chars()
        .all(|ch| ch.is_ascii_digit() || matches!(ch, '.' | 'e' | 'E' | '+' | '-'));
    if !well_formed {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

/// Accumulates in `f64` so literals wider than 64 bits stay finite.
fn radix_to_number(digits: &str, radix: u32) -> f64 {
    if digits.is_empty() {
        return f64::NAN;
    }
    digits
        .chars()
        .try_fold(0.0, |acc: f64, ch| {
            ch.to_digit(radix)
                .map(|digit| acc * f64::from(radix) + f64::from(digit))
        })
        .unwrap_or(f64::NAN)
}

/// `String(value)` for JSON arrays and objects.
pub(crate) fn js_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n
            .as_f64()
            .map_or_else(|| n.to_string(), nc_types::format_number),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(js_string)
            .collect::<Vec<_>>()
            .join(","),
        Value::Object(_) => "[object Object]".to_owned(),
    }
}
