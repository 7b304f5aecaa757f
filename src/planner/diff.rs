//! Field-level diffs between recorded and desired properties.
//!
//! Nested maps are walked so a change to `environment.TABLE_NAME` is
//! reported as that path rather than as the whole `environment` map.
//! Lists are compared as a whole.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Detail about a specific difference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffDetail {
    /// Dotted path of the field that differs.
    pub field: String,
    /// Old value, absent for added fields.
    pub old_value: Option<String>,
    /// New value, absent for removed fields.
    pub new_value: Option<String>,
}

impl DiffDetail {
    /// Creates a detail for a changed field.
    #[must_use]
    pub fn changed(field: impl Into<String>, old_value: &Value, new_value: &Value) -> Self {
        Self {
            field: field.into(),
            old_value: Some(render(old_value)),
            new_value: Some(render(new_value)),
        }
    }

    /// Returns true if the field is new.
    #[must_use]
    pub const fn is_addition(&self) -> bool {
        self.old_value.is_none()
    }

    /// Returns true if the field was removed.
    #[must_use]
    pub const fn is_removal(&self) -> bool {
        self.new_value.is_none()
    }
}

/// Computes the differences between two property maps.
#[must_use]
pub fn diff_properties(
    before: &BTreeMap<String, Value>,
    after: &BTreeMap<String, Value>,
) -> Vec<DiffDetail> {
    let mut details = Vec::new();
    let keys = before.keys().chain(after.keys()).collect::<std::collections::BTreeSet<_>>();
    for key in keys {
        diff_value(key, before.get(key), after.get(key), &mut details);
    }
    details
}

fn diff_value(path: &str, old: Option<&Value>, new: Option<&Value>, out: &mut Vec<DiffDetail>) {
    match (old, new) {
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            let keys = a.keys().chain(b.keys()).collect::<std::collections::BTreeSet<_>>();
            for key in keys {
                diff_value(&format!("{path}.{key}"), a.get(key), b.get(key), out);
            }
        }
        (Some(a), Some(b)) if a == b => {}
        (None, None) => {}
        (old, new) => out.push(DiffDetail {
            field: path.to_string(),
            old_value: old.map(render),
            new_value: new.map(render),
        }),
    }
}

/// Renders a value for display; strings are shown without quotes.
#[must_use]
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl std::fmt::Display for DiffDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.old_value, &self.new_value) {
            (Some(old), Some(new)) => write!(f, "{}: {old} -> {new}", self.field),
            (None, Some(new)) => write!(f, "+ {}: {new}", self.field),
            (Some(old), None) => write!(f, "- {}: {old}", self.field),
            (None, None) => write!(f, "{}", self.field),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::UNKNOWN;
    use serde_json::json;

    fn props(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_identical_maps_have_no_diff() {
        let a = props(json!({"hashKey": "id", "tags": {"env": "dev"}}));
        assert!(diff_properties(&a, &a.clone()).is_empty());
    }

    #[test]
    fn test_nested_change_reports_path() {
        let before = props(json!({"environment": {"TABLE_NAME": "old", "STAGE": "dev"}}));
        let after = props(json!({"environment": {"TABLE_NAME": "new", "STAGE": "dev"}}));
        let details = diff_properties(&before, &after);
        assert_eq!(details, vec![DiffDetail::changed("environment.TABLE_NAME", &json!("old"), &json!("new"))]);
        assert_eq!(details[0].to_string(), "environment.TABLE_NAME: old -> new");
    }

    #[test]
    fn test_added_and_removed_fields() {
        let before = props(json!({"memory": 128, "runtime": "nodejs18.x"}));
        let after = props(json!({"memory": 128, "timeout": 30}));
        let details = diff_properties(&before, &after);
        assert_eq!(details.len(), 2);
        assert!(details[0].is_removal());
        assert_eq!(details[0].field, "runtime");
        assert!(details[1].is_addition());
        assert_eq!(details[1].new_value.as_deref(), Some("30"));
    }

    #[test]
    fn test_unknown_value_is_shown() {
        let before = props(json!({"policy": "arn:aws:iam::1:role/a"}));
        let after = props(json!({"policy": UNKNOWN}));
        let details = diff_properties(&before, &after);
        assert_eq!(details[0].new_value.as_deref(), Some(UNKNOWN));
    }

    #[test]
    fn test_lists_compare_whole() {
        let before = props(json!({"routes": ["GET /todos"]}));
        let after = props(json!({"routes": ["GET /todos", "POST /todos"]}));
        let details = diff_properties(&before, &after);
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].field, "routes");
    }
}
