//! Resource nodes and their outputs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::value::PropertyExpr;

/// Identity of a resource: logical name plus type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    /// Logical name, unique within a stack.
    pub name: String,
    /// Resource type (e.g., `aws:lambda:Function`).
    #[serde(rename = "type")]
    pub resource_type: String,
}

impl ResourceId {
    /// Creates a new resource identity.
    #[must_use]
    pub fn new(name: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_type: resource_type.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.resource_type)
    }
}

/// Values a provider reports after applying a resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outputs {
    /// Provider-assigned identifier.
    pub physical_id: String,
    /// Output attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Outputs {
    /// Creates outputs with the given physical id and no attributes.
    #[must_use]
    pub fn new(physical_id: impl Into<String>) -> Self {
        Self {
            physical_id: physical_id.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Looks up a dotted attribute path.
    ///
    /// `id` falls back to the physical id when the provider did not report one.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<Value> {
        let mut parts = path.split('.');
        let head = parts.next()?;

        let root = match self.attributes.get(head) {
            Some(v) => v.clone(),
            None if head == "id" => Value::String(self.physical_id.clone()),
            None => return None,
        };

        parts.try_fold(root, |current, key| match current {
            Value::Object(mut map) => map.remove(key),
            Value::Array(mut items) => key
                .parse::<usize>()
                .ok()
                .filter(|i| *i < items.len())
                .map(|i| items.swap_remove(i)),
            _ => None,
        })
    }
}

/// Status of a node during and after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeStatus {
    /// Not yet settled.
    Pending,
    /// Created in this run.
    Created,
    /// Updated in this run.
    Updated,
    /// Deleted in this run.
    Deleted,
    /// Already converged.
    Unchanged,
    /// Not applied.
    Failed {
        /// Provider error, or the upstream failure that prevented the attempt.
        reason: String,
        /// Dependency chain from the failed producer to this node; empty for direct failures.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        path: Vec<String>,
    },
}

impl NodeStatus {
    /// Returns true once the node can no longer change in this run.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Returns true if the node failed or was skipped.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Deleted => write!(f, "deleted"),
            Self::Unchanged => write!(f, "unchanged"),
            Self::Failed { reason, .. } => write!(f, "failed: {reason}"),
        }
    }
}

/// A declared resource in the graph.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    /// Identity.
    pub id: ResourceId,
    /// Declaration index.
    pub index: usize,
    /// Declared properties with symbolic references.
    pub properties: BTreeMap<String, PropertyExpr>,
    /// Explicit `depends_on` entries.
    pub depends_on: Vec<String>,
    /// Outputs, once known.
    pub outputs: Option<Outputs>,
    /// Current status.
    pub status: NodeStatus,
}

impl ResourceNode {
    /// Returns the logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.id.name
    }

    /// Returns the resource type.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.id.resource_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outputs_id_falls_back_to_physical_id() {
        let outputs = Outputs::new("tbl-123");
        assert_eq!(outputs.get("id"), Some(json!("tbl-123")));

        let outputs = outputs.with_attribute("id", json!("explicit"));
        assert_eq!(outputs.get("id"), Some(json!("explicit")));
    }

    #[test]
    fn test_outputs_dotted_path() {
        let outputs = Outputs::new("x")
            .with_attribute("tags", json!({"Environment": "dev"}))
            .with_attribute("subnets", json!(["a", "b"]));

        assert_eq!(outputs.get("tags.Environment"), Some(json!("dev")));
        assert_eq!(outputs.get("subnets.1"), Some(json!("b")));
        assert_eq!(outputs.get("subnets.7"), None);
        assert_eq!(outputs.get("missing"), None);
    }

    #[test]
    fn test_status_display() {
        let status = NodeStatus::Failed {
            reason: "upstream dependency failed: table".into(),
            path: vec!["table".into(), "function".into()],
        };
        assert_eq!(status.to_string(), "failed: upstream dependency failed: table");
        assert!(status.is_failed());
        assert!(!NodeStatus::Pending.is_settled());
    }
}
