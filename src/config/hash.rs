//! Stack hashing for change detection.
//!
//! This module provides deterministic hashing of the stack program and of
//! resolved resource properties. Map keys are visited in sorted order, so
//! the hash does not depend on declaration order inside a property map.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::spec::{ResourceDecl, StackConfig};

/// Hasher for computing stack and property hashes.
#[derive(Debug, Default)]
pub struct StackHasher;

impl StackHasher {
    /// Creates a new stack hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole stack program.
    ///
    /// Resource order matters here since it drives tie-breaking in the
    /// apply order.
    #[must_use]
    pub fn hash_stack(&self, config: &StackConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());

        for resource in &config.resources {
            hasher.update(self.hash_resource(resource).as_bytes());
        }

        for (name, value) in &config.outputs {
            hasher.update(name.as_bytes());
            update_value(&mut hasher, value);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource declaration.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceDecl) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(resource.resource_type.as_bytes());
        hasher.update([0u8]);
        update_map(&mut hasher, &resource.properties);

        let mut deps: Vec<_> = resource.depends_on.iter().collect();
        deps.sort_unstable();
        for dep in deps {
            hasher.update(dep.as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of resolved properties, as stored in state records.
    #[must_use]
    pub fn hash_properties(&self, properties: &BTreeMap<String, Value>) -> String {
        let mut hasher = Sha256::new();
        update_map(&mut hasher, properties);
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

fn update_map(hasher: &mut Sha256, map: &BTreeMap<String, Value>) {
    hasher.update(b"{");
    for (key, value) in map {
        hasher.update(key.as_bytes());
        hasher.update(b":");
        update_value(hasher, value);
    }
    hasher.update(b"}");
}

// Each variant gets its own tag byte so that `"1"` and `1` hash differently.
fn update_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
            hasher.update(b";");
        }
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update(s.len().to_be_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                update_value(hasher, item);
            }
            hasher.update(b"]");
        }
        Value::Object(map) => {
            hasher.update(b"{");
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort_unstable();
            for key in keys {
                hasher.update(key.as_bytes());
                hasher.update(b":");
                if let Some(v) = map.get(key) {
                    update_value(hasher, v);
                }
            }
            hasher.update(b"}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(name: &str, properties: Value) -> ResourceDecl {
        ResourceDecl {
            name: name.to_string(),
            resource_type: String::from("aws:dynamodb:Table"),
            properties: serde_json::from_value(properties).unwrap(),
            depends_on: vec![],
        }
    }

    #[test]
    fn test_resource_hash_deterministic() {
        let hasher = StackHasher::new();
        let table = resource("table", json!({"hashKey": "id"}));

        assert_eq!(hasher.hash_resource(&table), hasher.hash_resource(&table));
    }

    #[test]
    fn test_different_resources_different_hash() {
        let hasher = StackHasher::new();
        let a = resource("table", json!({"hashKey": "id"}));
        let b = resource("table", json!({"hashKey": "pk"}));

        assert_ne!(hasher.hash_resource(&a), hasher.hash_resource(&b));
    }

    #[test]
    fn test_property_hash_distinguishes_types() {
        let hasher = StackHasher::new();
        let text: BTreeMap<String, Value> = [("n".to_string(), json!("1"))].into();
        let number: BTreeMap<String, Value> = [("n".to_string(), json!(1))].into();

        assert_ne!(hasher.hash_properties(&text), hasher.hash_properties(&number));
    }

    #[test]
    fn test_short_hash() {
        let hasher = StackHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");

        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(StackHasher::hashes_match("abc123", "abc123"));
        assert!(!StackHasher::hashes_match("abc123", "abc124"));
        assert!(!StackHasher::hashes_match("abc123", "abc12"));
    }
}
