//! Logical key conventions shared by every cached entity.
//!
//! Logical keys never carry the namespace; `MetaCache` prefixes them when
//! talking to the backend.

use nc_types::CacheScope;
use serde_json::{Map, Value};

pub const LIST_SUFFIX: &str = "list";

/// Text stored under a list key whose source query returned no rows.
pub const NONE_MARKER: &str = "NONE";

#[must_use]
pub fn entity_key(scope: CacheScope, id: &str) -> String {
    format!("{scope}:{id}")
}

/// `<scope>:<sub keys joined by ':'>:list`, empty sub keys skipped.
#[must_use]
pub fn list_key(scope: CacheScope, sub_keys: &[&str]) -> String {
    let mut key = scope.as_str().to_owned();
    for sub_key in sub_keys.iter().filter(|sub_key| !sub_key.is_empty()) {
        key.push(':');
        key.push_str(sub_key);
    }
    key.push(':');
    key.push_str(LIST_SUFFIX);
    key
}

#[must_use]
pub fn is_list_key(key: &str) -> bool {
    key.rsplit(':').next() == Some(LIST_SUFFIX) && key.contains(':')
}

/// Per-member key for an object written by `set_list`.
///
/// Role-scoped scopes append the member's `roles`, since the same entity is
/// listed once per role.
#[must_use]
pub fn member_key(scope: CacheScope, member: &Map<String, Value>) -> Option<String> {
    let id = scalar_text(member.get("id")?)?;
    let mut key = entity_key(scope, &id);
    if scope.is_role_scoped() {
        if let Some(roles) = member.get("roles").and_then(scalar_text) {
            key.push(':');
            key.push_str(&roles);
        }
    }
    Some(key)
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use nc_types::CacheScope;
    use serde_json::json;

    use super::{is_list_key, list_key, member_key};

    #[test]
    fn list_keys_skip_empty_segments() {
        assert_eq!(
            list_key(CacheScope::FilterExp, &["vw1", "", "fi1"]),
            "filterExp:vw1:fi1:list"
        );
        assert_eq!(list_key(CacheScope::Project, &[]), "project:list");
        assert!(is_list_key("filterExp:vw1:list"));
        assert!(!is_list_key("filterExp:checklist"));
    }

    #[test]
    fn role_scoped_members_get_compound_keys() {
        let member = json!({"id": "us1", "roles": "editor"});
        let member = member.as_object().expect("object");
        assert_eq!(
            member_key(CacheScope::UserProject, member).as_deref(),
            Some("userProject:us1:editor")
        );
        assert_eq!(
            member_key(CacheScope::View, member).as_deref(),
            Some("view:us1")
        );
        assert_eq!(
            member_key(CacheScope::View, json!({"title": "x"}).as_object().expect("object")),
            None
        );
    }
}
