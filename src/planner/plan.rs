//! Plan types and construction.
//!
//! A [`Plan`] is computed once per run from the resource graph and the
//! recorded state, and consumed once by the executor. Creates and updates
//! come first in topological order; deletes follow in reverse topological
//! order of the recorded dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::error::{PlanError, Result};
use crate::graph::{Reference, ResourceGraph, ResourceId, UNKNOWN, kahn_order, resolve_properties};
use crate::state::{StackState, StateRecord};

use super::diff::{DiffDetail, diff_properties};

/// Kinds of planned operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Create a resource that has no record.
    Create,
    /// Update a recorded resource in place.
    Update,
    /// Delete a recorded resource that is no longer declared.
    Delete,
}

/// A single planned operation.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedOperation {
    /// Operation kind.
    pub kind: OperationKind,
    /// Resource identity (the declared one for creates and updates).
    pub id: ResourceId,
    /// Graph index of the declared node; `None` for deletes.
    #[serde(skip)]
    pub node: Option<usize>,
    /// Physical id of the recorded resource, for updates and deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physical_id: Option<String>,
    /// Why the operation is needed.
    pub reason: String,
    /// Recorded properties before the operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<BTreeMap<String, Value>>,
    /// Desired properties as far as they are known at plan time.
    pub after: BTreeMap<String, Value>,
    /// Field-level differences between `before` and `after`.
    pub details: Vec<DiffDetail>,
    /// References only known once their producer has been applied.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unknown: Vec<String>,
    /// Plan indices that must settle first.
    pub dependencies: Vec<usize>,
}

/// An ordered set of operations that converges state to the declaration.
#[derive(Debug, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the stack program the plan was computed from.
    pub stack_hash: String,
    /// Operations in execution order.
    pub operations: Vec<PlannedOperation>,
    /// Declared resources that need no operation.
    pub unchanged: Vec<String>,
}

/// Computes plans.
#[derive(Debug, Default)]
pub struct Planner;

impl Planner {
    /// Creates a new planner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Plans the operations that bring `state` in line with `graph`.
    ///
    /// References are resolved against recorded outputs. A reference whose
    /// producer is itself planned is unknown until apply and shows up as
    /// [`UNKNOWN`] in the after snapshot.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::StateCycle` if the records to delete depend on
    /// each other in a cycle.
    pub fn plan(&self, graph: &ResourceGraph, state: &StackState, stack_hash: &str) -> Result<Plan> {
        let mut operations = Vec::new();
        let mut unchanged = Vec::new();
        let mut op_of_node: HashMap<usize, usize> = HashMap::new();

        for index in graph.topological_order() {
            let Some(node) = graph.get(index) else {
                continue;
            };

            let lookup = |r: &Reference| -> Option<Value> {
                let producer = graph.index_of(&r.resource)?;
                if op_of_node.contains_key(&producer) {
                    return None;
                }
                state.get(&r.resource)?.to_outputs().get(&r.attribute)
            };
            let (after, unknown) = resolve_properties(&node.properties, &lookup);

            let mut dependencies: Vec<usize> = graph
                .producers(index)
                .iter()
                .filter_map(|p| op_of_node.get(p).copied())
                .collect();
            dependencies.sort_unstable();

            let unknown: Vec<String> = unknown.iter().map(ToString::to_string).collect();

            let operation = match state.get(node.name()) {
                None => PlannedOperation {
                    kind: OperationKind::Create,
                    id: node.id.clone(),
                    node: Some(index),
                    physical_id: None,
                    reason: String::from("not in state"),
                    before: None,
                    details: diff_properties(&BTreeMap::new(), &after),
                    after,
                    unknown,
                    dependencies,
                },
                Some(record) => {
                    let type_changed = record.id.resource_type != node.resource_type();
                    let edges = graph.dependency_names(index);
                    let edges_changed = !record.has_dependencies(&edges);
                    if !type_changed && !edges_changed && unknown.is_empty() && record.properties == after {
                        debug!("{} is up to date", node.id);
                        unchanged.push(node.name().to_string());
                        continue;
                    }

                    let mut details = diff_properties(&record.properties, &after);
                    let reason = if type_changed {
                        details.insert(
                            0,
                            DiffDetail {
                                field: String::from("type"),
                                old_value: Some(record.id.resource_type.clone()),
                                new_value: Some(node.resource_type().to_string()),
                            },
                        );
                        "type changed"
                    } else if details.iter().any(|d| d.new_value.as_deref() != Some(UNKNOWN)) {
                        "properties changed"
                    } else if unknown.is_empty() {
                        details.push(DiffDetail {
                            field: String::from("dependencies"),
                            old_value: Some(record.dependencies.join(", ")),
                            new_value: Some(edges.join(", ")),
                        });
                        "dependencies changed"
                    } else {
                        "inputs known after apply"
                    };

                    PlannedOperation {
                        kind: OperationKind::Update,
                        id: node.id.clone(),
                        node: Some(index),
                        physical_id: Some(record.physical_id.clone()),
                        reason: reason.to_string(),
                        before: Some(record.properties.clone()),
                        after,
                        details,
                        unknown,
                        dependencies,
                    }
                }
            };

            debug!("Planned {} of {} ({})", operation.kind, operation.id, operation.reason);
            op_of_node.insert(index, operations.len());
            operations.push(operation);
        }

        let doomed: Vec<&StateRecord> = state
            .records
            .values()
            .filter(|r| graph.index_of(&r.id.name).is_none())
            .collect();

        // Nodes whose previous record referenced a doomed resource must move
        // off it before it goes.
        let updaters: Vec<(usize, &StateRecord)> = op_of_node
            .iter()
            .filter_map(|(&node, &op)| {
                graph
                    .get(node)
                    .and_then(|n| state.get(n.name()))
                    .map(|record| (op, record))
            })
            .collect();

        push_deletes(&mut operations, &doomed, &updaters)?;

        Ok(Plan {
            created_at: Utc::now(),
            stack_hash: stack_hash.to_string(),
            operations,
            unchanged,
        })
    }

    /// Plans the deletion of every recorded resource, dependents first.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::StateCycle` if the records depend on each other in
    /// a cycle.
    pub fn plan_destroy(&self, state: &StackState) -> Result<Plan> {
        let doomed: Vec<&StateRecord> = state.records.values().collect();
        let mut operations = Vec::with_capacity(doomed.len());
        push_deletes(&mut operations, &doomed, &[])?;

        Ok(Plan {
            created_at: Utc::now(),
            stack_hash: String::new(),
            operations,
            unchanged: Vec::new(),
        })
    }
}

/// Appends delete operations in reverse dependency order.
fn push_deletes(
    operations: &mut Vec<PlannedOperation>,
    doomed: &[&StateRecord],
    updaters: &[(usize, &StateRecord)],
) -> Result<()> {
    let position: HashMap<&str, usize> = doomed
        .iter()
        .enumerate()
        .map(|(i, r)| (r.id.name.as_str(), i))
        .collect();

    let producers: Vec<Vec<usize>> = doomed
        .iter()
        .map(|r| {
            let mut list: Vec<usize> = r
                .dependencies
                .iter()
                .filter_map(|d| position.get(d.as_str()).copied())
                .collect();
            list.sort_unstable();
            list.dedup();
            list
        })
        .collect();

    let order = kahn_order(&producers).map_err(|(_, stuck)| PlanError::StateCycle {
        resources: stuck.iter().map(|&i| doomed[i].id.name.clone()).collect(),
    })?;

    let mut op_index: HashMap<usize, usize> = HashMap::new();
    for &i in order.iter().rev() {
        let record = doomed[i];
        let name = &record.id.name;

        let mut dependencies: Vec<usize> = doomed
            .iter()
            .enumerate()
            .filter(|(_, other)| other.dependencies.iter().any(|d| d == name))
            .filter_map(|(j, _)| op_index.get(&j).copied())
            .chain(
                updaters
                    .iter()
                    .filter(|(_, previous)| previous.dependencies.iter().any(|d| d == name))
                    .map(|(op, _)| *op),
            )
            .collect();
        dependencies.sort_unstable();
        dependencies.dedup();

        debug!("Planned delete of {}", record.id);
        op_index.insert(i, operations.len());
        operations.push(PlannedOperation {
            kind: OperationKind::Delete,
            id: record.id.clone(),
            node: None,
            physical_id: Some(record.physical_id.clone()),
            reason: String::from("no longer declared"),
            before: Some(record.properties.clone()),
            after: BTreeMap::new(),
            details: diff_properties(&record.properties, &BTreeMap::new()),
            unknown: Vec::new(),
            dependencies,
        });
    }

    Ok(())
}

impl Plan {
    /// Returns true if the plan has no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Returns the number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Returns the declared resources that need no operation.
    #[must_use]
    pub fn unchanged(&self) -> &[String] {
        &self.unchanged
    }

    /// Returns the number of operations of a kind.
    #[must_use]
    pub fn count(&self, kind: OperationKind) -> usize {
        self.operations.iter().filter(|o| o.kind == kind).count()
    }

    /// Finds the operation planned for a resource.
    #[must_use]
    pub fn operation_for(&self, name: &str) -> Option<&PlannedOperation> {
        self.operations.iter().find(|o| o.id.name == name)
    }
}

impl PlannedOperation {
    /// Returns a human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self.kind {
            OperationKind::Create => format!("Create '{}'", self.id),
            OperationKind::Update => format!("Update '{}'", self.id),
            OperationKind::Delete => format!("Delete '{}'", self.id),
        }
    }

    /// Returns the logical name of the resource.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.id.name
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.id)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.operations.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan ({} operations):", self.operations.len())?;
        for (i, operation) in self.operations.iter().enumerate() {
            writeln!(f, "  {i}. {operation}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceDecl;
    use crate::error::ConvergeError;
    use crate::graph::{GraphBuilder, Outputs};
    use serde_json::json;

    fn decl(name: &str, resource_type: &str, properties: Value) -> ResourceDecl {
        ResourceDecl {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            properties: serde_json::from_value(properties).unwrap(),
            depends_on: vec![],
        }
    }

    fn record(name: &str, resource_type: &str, properties: Value, deps: &[&str]) -> StateRecord {
        let properties: BTreeMap<String, Value> = serde_json::from_value(properties).unwrap();
        let mut outputs = Outputs::new(format!("{name}-1"))
            .with_attribute("name", json!(format!("{name}-1")))
            .with_attribute("arn", json!(format!("arn:{name}")));
        outputs.attributes.extend(properties.clone());
        StateRecord::new(
            ResourceId::new(name, resource_type),
            outputs,
            properties,
            deps.iter().map(ToString::to_string).collect(),
            String::from("h"),
        )
    }

    fn table_and_function() -> Vec<ResourceDecl> {
        vec![
            decl(
                "function",
                "aws:lambda:Function",
                json!({"environment": {"TABLE_NAME": "${table.name}"}}),
            ),
            decl("table", "aws:dynamodb:Table", json!({"hashKey": "id"})),
        ]
    }

    fn converged_state() -> StackState {
        let mut state = StackState::new("app", "dev");
        state.set_record(record("table", "aws:dynamodb:Table", json!({"hashKey": "id"}), &[]));
        state.set_record(record(
            "function",
            "aws:lambda:Function",
            json!({"environment": {"TABLE_NAME": "table-1"}}),
            &["table"],
        ));
        state
    }

    fn plan(resources: &[ResourceDecl], state: &StackState) -> Plan {
        let graph = GraphBuilder::new().build(resources).unwrap();
        Planner::new().plan(&graph, state, "hash").unwrap()
    }

    fn summary(plan: &Plan) -> Vec<String> {
        plan.operations
            .iter()
            .map(|o| format!("{} {}", o.kind, o.name()))
            .collect()
    }

    #[test]
    fn test_fresh_stack_creates_producers_first() {
        let plan = plan(&table_and_function(), &StackState::new("app", "dev"));
        assert_eq!(summary(&plan), vec!["create table", "create function"]);

        let function = &plan.operations[1];
        assert_eq!(function.dependencies, vec![0]);
        assert_eq!(function.after["environment"]["TABLE_NAME"], json!(UNKNOWN));
        assert_eq!(function.unknown, vec!["${table.name}"]);
        assert!(plan.operations[0].unknown.is_empty());
    }

    #[test]
    fn test_converged_state_plans_nothing() {
        let plan = plan(&table_and_function(), &converged_state());
        assert!(plan.is_empty());
        assert_eq!(plan.unchanged(), &["table", "function"]);
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_changed_producer_makes_consumer_unknown() {
        let mut resources = table_and_function();
        resources[1] = decl("table", "aws:dynamodb:Table", json!({"hashKey": "pk"}));

        let plan = plan(&resources, &converged_state());
        assert_eq!(summary(&plan), vec!["update table", "update function"]);

        let table = &plan.operations[0];
        assert_eq!(table.reason, "properties changed");
        assert_eq!(table.details, vec![DiffDetail::changed("hashKey", &json!("id"), &json!("pk"))]);
        assert_eq!(table.physical_id.as_deref(), Some("table-1"));

        let function = &plan.operations[1];
        assert_eq!(function.reason, "inputs known after apply");
        assert_eq!(function.dependencies, vec![0]);
    }

    #[test]
    fn test_type_change_is_an_update() {
        let mut resources = table_and_function();
        resources[1] = decl("table", "aws:dynamodb:GlobalTable", json!({"hashKey": "id"}));

        let plan = plan(&resources, &converged_state());
        let table = plan.operation_for("table").unwrap();
        assert_eq!(table.kind, OperationKind::Update);
        assert_eq!(table.reason, "type changed");
        assert_eq!(table.details[0].field, "type");
    }

    #[test]
    fn test_new_explicit_edge_is_an_update() {
        let mut state = StackState::new("app", "dev");
        state.set_record(record("x", "test:index:Thing", json!({}), &[]));
        state.set_record(record("y", "test:index:Thing", json!({}), &[]));

        let mut y = decl("y", "test:index:Thing", json!({}));
        y.depends_on = vec![String::from("x")];
        let resources = vec![decl("x", "test:index:Thing", json!({})), y];

        let plan = plan(&resources, &state);
        assert_eq!(summary(&plan), vec!["update y"]);
        assert_eq!(plan.unchanged(), &["x"]);

        let y = &plan.operations[0];
        assert_eq!(y.reason, "dependencies changed");
        assert_eq!(y.details[0].field, "dependencies");
        assert_eq!(y.details[0].new_value.as_deref(), Some("x"));
        assert!(y.dependencies.is_empty());
    }

    #[test]
    fn test_removed_resources_delete_dependents_first() {
        let mut state = converged_state();
        state.set_record(record("policy", "aws:iam:RolePolicy", json!({}), &["role"]));
        state.set_record(record("role", "aws:iam:Role", json!({}), &[]));

        let plan = plan(&table_and_function(), &state);
        assert_eq!(summary(&plan), vec!["delete policy", "delete role"]);
        assert_eq!(plan.operations[1].dependencies, vec![0]);
        assert_eq!(plan.count(OperationKind::Delete), 2);
    }

    #[test]
    fn test_delete_waits_for_consumer_to_move_off() {
        let mut state = converged_state();
        // function used to read from old-table.
        state.set_record(record(
            "function",
            "aws:lambda:Function",
            json!({"environment": {"TABLE_NAME": "old-table-1"}}),
            &["old-table"],
        ));
        state.set_record(record("old-table", "aws:dynamodb:Table", json!({}), &[]));

        let plan = plan(&table_and_function(), &state);
        assert_eq!(summary(&plan), vec!["update function", "delete old-table"]);
        assert_eq!(plan.operations[1].dependencies, vec![0]);
    }

    #[test]
    fn test_destroy_reverses_recorded_order() {
        let plan = Planner::new().plan_destroy(&converged_state()).unwrap();
        assert_eq!(summary(&plan), vec!["delete function", "delete table"]);
        assert_eq!(plan.operations[1].dependencies, vec![0]);
        assert!(plan.stack_hash.is_empty());
    }

    #[test]
    fn test_state_cycle_is_reported() {
        let mut state = StackState::new("app", "dev");
        state.set_record(record("a", "t", json!({}), &["b"]));
        state.set_record(record("b", "t", json!({}), &["a"]));

        let err = Planner::new().plan_destroy(&state).unwrap_err();
        match err {
            ConvergeError::Plan(PlanError::StateCycle { resources }) => {
                assert_eq!(resources, vec!["a", "b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_plan_display() {
        let plan = plan(&table_and_function(), &StackState::new("app", "dev"));
        let text = plan.to_string();
        assert!(text.starts_with("Plan (2 operations):"));
        assert!(text.contains("0. create table (aws:dynamodb:Table) (not in state)"));
    }
}
