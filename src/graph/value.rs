//! Property expressions.
//!
//! Declared property values are parsed into [`PropertyExpr`] trees during the
//! declare phase. References to other resources stay symbolic until they are
//! resolved, either at plan time against recorded outputs or at apply time
//! against freshly produced ones.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Placeholder rendered for values that only exist once a producer is applied.
pub const UNKNOWN: &str = "(known after apply)";

/// A reference to an output attribute of another resource: `${name.attr}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Logical name of the producing resource.
    pub resource: String,
    /// Attribute path on the producer's outputs; may be dotted.
    pub attribute: String,
}

/// A piece of a template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text.
    Text(String),
    /// Embedded reference.
    Ref(Reference),
}

/// A declared property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyExpr {
    /// A value with no references.
    Literal(Value),
    /// A string that is exactly one reference; resolves to the referenced value as is.
    Reference(Reference),
    /// A string with embedded references; always resolves to a string.
    Template(Vec<Segment>),
    /// A list of nested expressions.
    List(Vec<PropertyExpr>),
    /// A map of nested expressions.
    Map(BTreeMap<String, PropertyExpr>),
}

/// The outcome of resolving an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// The resolved value, with [`UNKNOWN`] in place of unknown references.
    pub value: Value,
    /// References that could not be resolved.
    pub unknown: Vec<Reference>,
}

impl Resolved {
    /// Returns true if every reference was resolved.
    #[must_use]
    pub fn is_known(&self) -> bool {
        self.unknown.is_empty()
    }
}

impl Reference {
    /// Parses the body of `${...}`.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if the body is not `name.attribute`.
    pub fn parse(body: &str) -> Result<Self, String> {
        let body = body.trim();
        if body.is_empty() {
            return Err(String::from("empty reference"));
        }

        let Some((resource, attribute)) = body.split_once('.') else {
            return Err(format!(
                "reference '{body}' must name an attribute, as in '{body}.id'"
            ));
        };

        if resource.is_empty() {
            return Err(String::from("reference is missing the resource name"));
        }
        if attribute.is_empty() || attribute.split('.').any(str::is_empty) {
            return Err(format!("reference '{body}' has an empty attribute path"));
        }
        if resource.contains(['$', '{', '}']) || attribute.contains(['$', '{', '}']) {
            return Err(format!("reference '{body}' contains nested interpolation"));
        }

        Ok(Self {
            resource: resource.to_string(),
            attribute: attribute.to_string(),
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.resource, self.attribute)
    }
}

impl PropertyExpr {
    /// Parses a declared value into an expression.
    ///
    /// `$${` escapes a literal `${`.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed reference.
    pub fn parse(value: &Value) -> Result<Self, String> {
        match value {
            Value::String(s) => parse_string(s),
            Value::Array(items) => items
                .iter()
                .map(Self::parse)
                .collect::<Result<Vec<_>, _>>()
                .map(|items| Self::List(items).simplify()),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Self::parse(v).map(|e| (k.clone(), e)))
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(|map| Self::Map(map).simplify()),
            other => Ok(Self::Literal(other.clone())),
        }
    }

    // Collapses reference-free containers back into a literal.
    fn simplify(self) -> Self {
        if self.references().is_empty() {
            Self::Literal(self.to_literal_value())
        } else {
            self
        }
    }

    fn to_literal_value(&self) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::List(items) => Value::Array(items.iter().map(Self::to_literal_value).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_literal_value()))
                    .collect(),
            ),
            Self::Reference(r) => Value::String(r.to_string()),
            Self::Template(segments) => Value::String(
                segments
                    .iter()
                    .map(|s| match s {
                        Segment::Text(t) => t.clone(),
                        Segment::Ref(r) => r.to_string(),
                    })
                    .collect(),
            ),
        }
    }

    /// Returns every reference in this expression, in source order.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(r) => out.push(r),
            Self::Template(segments) => {
                for segment in segments {
                    if let Segment::Ref(r) = segment {
                        out.push(r);
                    }
                }
            }
            Self::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Map(map) => {
                for item in map.values() {
                    item.collect_references(out);
                }
            }
        }
    }

    /// Resolves the expression; `lookup` returns `None` for unknown values.
    pub fn resolve<F>(&self, lookup: &F) -> Resolved
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        let mut unknown = Vec::new();
        let value = self.resolve_into(lookup, &mut unknown);
        Resolved { value, unknown }
    }

    fn resolve_into<F>(&self, lookup: &F, unknown: &mut Vec<Reference>) -> Value
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Reference(r) => lookup(r).unwrap_or_else(|| {
                unknown.push(r.clone());
                Value::String(UNKNOWN.to_string())
            }),
            Self::Template(segments) => {
                let mut rendered = String::new();
                let mut complete = true;
                for segment in segments {
                    match segment {
                        Segment::Text(t) => rendered.push_str(t),
                        Segment::Ref(r) => match lookup(r) {
                            Some(Value::String(s)) => rendered.push_str(&s),
                            Some(other) => rendered.push_str(&other.to_string()),
                            None => {
                                unknown.push(r.clone());
                                complete = false;
                            }
                        },
                    }
                }
                if complete {
                    Value::String(rendered)
                } else {
                    Value::String(UNKNOWN.to_string())
                }
            }
            Self::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.resolve_into(lookup, unknown))
                    .collect(),
            ),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.resolve_into(lookup, unknown)))
                    .collect(),
            ),
        }
    }
}

/// Resolves a whole property map.
pub fn resolve_properties<F>(properties: &BTreeMap<String, PropertyExpr>, lookup: &F) -> (BTreeMap<String, Value>, Vec<Reference>)
where
    F: Fn(&Reference) -> Option<Value>,
{
    let mut unknown = Vec::new();
    let resolved = properties
        .iter()
        .map(|(key, expr)| {
            let r = expr.resolve(lookup);
            unknown.extend(r.unknown);
            (key.clone(), r.value)
        })
        .collect();
    (resolved, unknown)
}

fn parse_string(s: &str) -> Result<PropertyExpr, String> {
    if !s.contains("${") {
        return Ok(PropertyExpr::Literal(Value::String(s.to_string())));
    }

    let mut segments: Vec<Segment> = Vec::new();
    let mut text = String::new();
    let mut rest = s;

    while let Some(start) = rest.find("${") {
        // `$${` is an escaped `${`.
        if start > 0 && rest.as_bytes()[start - 1] == b'$' {
            text.push_str(&rest[..start - 1]);
            text.push_str("${");
            rest = &rest[start + 2..];
            continue;
        }

        text.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(format!("unterminated reference in '{s}'"));
        };

        if !text.is_empty() {
            segments.push(Segment::Text(std::mem::take(&mut text)));
        }
        segments.push(Segment::Ref(Reference::parse(&after[..end])?));
        rest = &after[end + 1..];
    }
    text.push_str(rest);
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }

    match segments.as_slice() {
        [Segment::Ref(r)] => Ok(PropertyExpr::Reference(r.clone())),
        [Segment::Text(t)] => Ok(PropertyExpr::Literal(Value::String(t.clone()))),
        _ => Ok(PropertyExpr::Template(segments)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn r(resource: &str, attribute: &str) -> Reference {
        Reference {
            resource: resource.to_string(),
            attribute: attribute.to_string(),
        }
    }

    #[test]
    fn test_parse_whole_reference() {
        let expr = PropertyExpr::parse(&json!("${todo-table.name}")).unwrap();
        assert_eq!(expr, PropertyExpr::Reference(r("todo-table", "name")));
    }

    #[test]
    fn test_parse_template() {
        let expr = PropertyExpr::parse(&json!("arn:${role.arn}/policy")).unwrap();
        assert_eq!(
            expr,
            PropertyExpr::Template(vec![
                Segment::Text("arn:".into()),
                Segment::Ref(r("role", "arn")),
                Segment::Text("/policy".into()),
            ])
        );
    }

    #[test]
    fn test_parse_nested_containers() {
        let expr = PropertyExpr::parse(&json!({
            "variables": { "TABLE_NAME": "${table.name}" },
            "memory": 128
        }))
        .unwrap();
        assert_eq!(expr.references(), vec![&r("table", "name")]);
    }

    #[test]
    fn test_reference_free_containers_are_literals() {
        let value = json!({"a": [1, "two", {"b": null}]});
        assert_eq!(
            PropertyExpr::parse(&value).unwrap(),
            PropertyExpr::Literal(value)
        );
    }

    #[test]
    fn test_escaped_interpolation() {
        let expr = PropertyExpr::parse(&json!("cost: $${literal}")).unwrap();
        assert_eq!(expr, PropertyExpr::Literal(json!("cost: ${literal}")));
    }

    #[test]
    fn test_malformed_references() {
        assert!(PropertyExpr::parse(&json!("${}")).is_err());
        assert!(PropertyExpr::parse(&json!("${table}")).is_err());
        assert!(PropertyExpr::parse(&json!("${table.}")).is_err());
        assert!(PropertyExpr::parse(&json!("x ${table.name")).is_err());
    }

    #[test]
    fn test_resolve_known_and_unknown() {
        let expr = PropertyExpr::parse(&json!({
            "name": "${table.name}",
            "arn": "arn:${role.arn}",
            "size": "${table.size}"
        }))
        .unwrap();

        let lookup = |reference: &Reference| match (reference.resource.as_str(), reference.attribute.as_str()) {
            ("table", "name") => Some(json!("todos")),
            ("table", "size") => Some(json!(5)),
            _ => None,
        };

        let resolved = expr.resolve(&lookup);
        assert_eq!(
            resolved.value,
            json!({"name": "todos", "arn": UNKNOWN, "size": 5})
        );
        assert_eq!(resolved.unknown, vec![r("role", "arn")]);
        assert!(!resolved.is_known());
    }

    #[test]
    fn test_template_renders_non_string_values() {
        let expr = PropertyExpr::parse(&json!("port-${svc.port}")).unwrap();
        let resolved = expr.resolve(&|_: &Reference| Some(json!(8080)));
        assert_eq!(resolved.value, json!("port-8080"));
    }

    #[test]
    fn test_reference_display() {
        assert_eq!(r("table", "name").to_string(), "${table.name}");
    }
}
