#![no_main]

use libfuzzer_sys::fuzz_target;
use nc_condition::{ConditionRule, validate_condition};
use serde_json::{Map, Value};

// Input: rules JSON, a newline, row JSON.
fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Some((rules, row)) = text.split_once('\n') else {
        return;
    };
    let Ok(rules) = serde_json::from_str::<Vec<ConditionRule>>(rules) else {
        return;
    };
    let Ok(row) = serde_json::from_str::<Map<String, Value>>(row) else {
        return;
    };
    let _ = validate_condition(&rules, &row);
});
