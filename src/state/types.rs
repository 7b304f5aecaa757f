//! State types for tracking applied resources.
//!
//! These types represent the recorded state of a stack: what was last
//! applied for each resource and what the provider reported back. The
//! planner diffs declarations against them and the executor keeps them
//! current as operations settle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::graph::{Outputs, ResourceId};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of run history entries kept in the state document.
pub const MAX_HISTORY: usize = 100;

/// The persisted state of a stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied stack program.
    #[serde(default)]
    pub stack_hash: String,
    /// Records keyed by logical resource name.
    #[serde(default)]
    pub records: BTreeMap<String, StateRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// The recorded state of one applied resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Resource identity.
    pub id: ResourceId,
    /// Provider-assigned identifier.
    pub physical_id: String,
    /// Last applied properties, fully resolved.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Output attributes reported by the provider.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Logical names of the resources this one depended on when applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Hash of `properties`.
    pub properties_hash: String,
    /// When the resource was first created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last applied.
    pub last_applied: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// Run identifier.
    pub run_id: String,
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Stack hash at the time of the run.
    pub stack_hash: String,
    /// Resources that were created, updated or deleted.
    pub resources: Vec<String>,
    /// Whether every operation succeeded.
    pub success: bool,
    /// Summary of failures, if any.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Converge the stack to its declaration.
    Apply,
    /// Delete every recorded resource.
    Destroy,
}

impl StackState {
    /// Creates a new empty stack state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            stack_hash: String::new(),
            records: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a record by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StateRecord> {
        self.records.get(name)
    }

    /// Adds or replaces a record.
    pub fn set_record(&mut self, record: StateRecord) {
        self.records.insert(record.id.name.clone(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record by name.
    pub fn remove_record(&mut self, name: &str) -> Option<StateRecord> {
        let result = self.records.remove(name);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Adds a history entry, dropping the oldest beyond [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
        self.last_updated = Utc::now();
    }

    /// Returns all record names, sorted.
    #[must_use]
    pub fn record_names(&self) -> Vec<&str> {
        self.records.keys().map(String::as_str).collect()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl StateRecord {
    /// Creates a record for a freshly applied resource.
    #[must_use]
    pub fn new(
        id: ResourceId,
        outputs: Outputs,
        properties: BTreeMap<String, Value>,
        dependencies: Vec<String>,
        properties_hash: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            physical_id: outputs.physical_id,
            properties,
            outputs: outputs.attributes,
            dependencies,
            properties_hash,
            created_at: now,
            last_applied: now,
        }
    }

    /// Keeps the creation time of a previous record.
    #[must_use]
    pub fn replacing(mut self, previous: Option<&Self>) -> Self {
        if let Some(previous) = previous {
            self.created_at = previous.created_at;
        }
        self
    }

    /// Returns true if the record depends on exactly `names`, in any order.
    #[must_use]
    pub fn has_dependencies(&self, names: &[String]) -> bool {
        let mut recorded: Vec<&str> = self.dependencies.iter().map(String::as_str).collect();
        let mut current: Vec<&str> = names.iter().map(String::as_str).collect();
        recorded.sort_unstable();
        recorded.dedup();
        current.sort_unstable();
        current.dedup();
        recorded == current
    }

    /// Returns the recorded outputs.
    #[must_use]
    pub fn to_outputs(&self) -> Outputs {
        Outputs {
            physical_id: self.physical_id.clone(),
            attributes: self.outputs.clone(),
        }
    }
}

impl RunHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(run_id: &str, operation: RunOperation, stack_hash: &str, resources: Vec<String>) -> Self {
        Self {
            run_id: run_id.to_string(),
            timestamp: Utc::now(),
            operation,
            stack_hash: stack_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Marks the entry as failed.
    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(name: &str) -> StateRecord {
        StateRecord::new(
            ResourceId::new(name, "aws:dynamodb:Table"),
            Outputs::new(format!("{name}-1")).with_attribute("arn", json!("arn:x")),
            BTreeMap::new(),
            vec![],
            String::from("hash"),
        )
    }

    #[test]
    fn test_set_and_remove_record() {
        let mut state = StackState::new("app", "dev");
        state.set_record(record("table"));
        assert_eq!(state.record_names(), vec!["table"]);
        assert_eq!(state.get("table").unwrap().to_outputs().physical_id, "table-1");

        assert!(state.remove_record("table").is_some());
        assert!(state.is_empty());
        assert!(state.remove_record("table").is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = StackState::new("app", "dev");
        for i in 0..(MAX_HISTORY + 5) {
            state.add_history(RunHistoryEntry::new(&format!("run-{i}"), RunOperation::Apply, "h", vec![]));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].run_id, "run-5");
    }

    #[test]
    fn test_replacing_keeps_created_at() {
        let original = record("table");
        let replaced = record("table").replacing(Some(&original));
        assert_eq!(replaced.created_at, original.created_at);
    }

    #[test]
    fn test_has_dependencies_ignores_order() {
        let mut rec = record("function");
        rec.dependencies = vec![String::from("table"), String::from("role")];
        assert!(rec.has_dependencies(&[String::from("role"), String::from("table")]));
        assert!(!rec.has_dependencies(&[String::from("table")]));
        assert!(!record("table").has_dependencies(&[String::from("role")]));
    }

    #[test]
    fn test_state_json_shape() {
        let mut state = StackState::new("app", "dev");
        state.set_record(record("table"));
        let json = serde_json::to_value(&state).unwrap();
        let table = &json["records"]["table"];
        assert_eq!(table["id"]["type"], "aws:dynamodb:Table");
        assert_eq!(table["physical_id"], "table-1");
        assert_eq!(table["outputs"]["arn"], "arn:x");

        let back: StackState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
