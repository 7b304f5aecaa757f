//! Resource graph construction.
//!
//! The builder works in three phases:
//! 1. declare: every property is parsed into a symbolic [`PropertyExpr`]
//! 2. link: references and `depends_on` entries become edges
//! 3. check: a depth-first walk rejects cycles
//!
//! No output is resolved here. Resolution happens later, at plan time
//! against recorded state and at apply time against fresh outputs.

use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::config::{ResourceDecl, StackConfig};
use crate::error::GraphError;

use super::dag::ResourceGraph;
use super::node::{NodeStatus, ResourceId, ResourceNode};
use super::value::PropertyExpr;

/// Name used in errors for references made from stack outputs.
const OUTPUTS_SCOPE: &str = "outputs";

/// Builds a [`ResourceGraph`] from declared resources.
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the graph for a whole stack, including its outputs.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] for malformed or dangling references,
    /// duplicate names and cycles.
    pub fn build_stack(&self, config: &StackConfig) -> Result<ResourceGraph, GraphError> {
        self.build_with_outputs(&config.resources, &config.outputs)
    }

    /// Builds the graph for a list of resources.
    ///
    /// # Errors
    ///
    /// See [`GraphBuilder::build_stack`].
    pub fn build(&self, resources: &[ResourceDecl]) -> Result<ResourceGraph, GraphError> {
        self.build_with_outputs(resources, &BTreeMap::new())
    }

    fn build_with_outputs(
        &self,
        resources: &[ResourceDecl],
        outputs: &BTreeMap<String, serde_json::Value>,
    ) -> Result<ResourceGraph, GraphError> {
        let nodes = Self::declare(resources)?;
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.name.as_str(), i))
            .collect();

        let producers = Self::link(&nodes, &index)?;
        Self::check_acyclic(&nodes, &producers)?;

        let outputs = Self::declare_outputs(outputs, &index)?;

        debug!(
            "Built resource graph: {} nodes, {} edges",
            nodes.len(),
            producers.iter().map(Vec::len).sum::<usize>()
        );

        Ok(ResourceGraph::from_parts(nodes, producers, outputs))
    }

    /// Phase 1: parse every declared property.
    fn declare(resources: &[ResourceDecl]) -> Result<Vec<ResourceNode>, GraphError> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut nodes = Vec::with_capacity(resources.len());

        for (i, decl) in resources.iter().enumerate() {
            if seen.insert(decl.name.as_str(), i).is_some() {
                return Err(GraphError::DuplicateResource {
                    name: decl.name.clone(),
                });
            }

            let mut properties = BTreeMap::new();
            for (key, value) in &decl.properties {
                let expr = PropertyExpr::parse(value).map_err(|reason| {
                    GraphError::InvalidReference {
                        resource: decl.name.clone(),
                        expression: value.to_string(),
                        reason,
                    }
                })?;
                properties.insert(key.clone(), expr);
            }

            nodes.push(ResourceNode {
                id: ResourceId::new(&decl.name, &decl.resource_type),
                index: i,
                properties,
                depends_on: decl.depends_on.clone(),
                outputs: None,
                status: NodeStatus::Pending,
            });
        }

        Ok(nodes)
    }

    /// Phase 2: turn references and explicit dependencies into edges.
    fn link(
        nodes: &[ResourceNode],
        index: &HashMap<&str, usize>,
    ) -> Result<Vec<Vec<usize>>, GraphError> {
        let mut producers = Vec::with_capacity(nodes.len());

        for node in nodes {
            let mut deps: Vec<usize> = Vec::new();

            for (property, expr) in &node.properties {
                for reference in expr.references() {
                    let Some(&producer) = index.get(reference.resource.as_str()) else {
                        return Err(GraphError::UnresolvedReference {
                            resource: node.id.name.clone(),
                            property: property.clone(),
                            reference: reference.to_string(),
                        });
                    };
                    deps.push(producer);
                }
            }

            for dep in &node.depends_on {
                let Some(&producer) = index.get(dep.as_str()) else {
                    return Err(GraphError::UnresolvedReference {
                        resource: node.id.name.clone(),
                        property: String::from("depends_on"),
                        reference: dep.clone(),
                    });
                };
                deps.push(producer);
            }

            deps.sort_unstable();
            deps.dedup();
            producers.push(deps);
        }

        Ok(producers)
    }

    /// Phase 3: depth-first search with a recursion stack.
    fn check_acyclic(nodes: &[ResourceNode], producers: &[Vec<usize>]) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; nodes.len()];

        for root in 0..nodes.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }

            // Each frame is (node, next producer slot to visit).
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::OnStack;

            while let Some(frame) = stack.last_mut() {
                let current = frame.0;
                let Some(&next) = producers[current].get(frame.1) else {
                    marks[current] = Mark::Done;
                    stack.pop();
                    continue;
                };
                frame.1 += 1;

                match marks[next] {
                    Mark::Unvisited => {
                        marks[next] = Mark::OnStack;
                        stack.push((next, 0));
                    }
                    Mark::OnStack => {
                        let start = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                        let mut path: Vec<String> = stack[start..]
                            .iter()
                            .map(|(n, _)| nodes[*n].id.name.clone())
                            .collect();
                        path.push(nodes[next].id.name.clone());
                        return Err(GraphError::Cycle { path });
                    }
                    Mark::Done => {}
                }
            }
        }

        Ok(())
    }

    fn declare_outputs(
        outputs: &BTreeMap<String, serde_json::Value>,
        index: &HashMap<&str, usize>,
    ) -> Result<BTreeMap<String, PropertyExpr>, GraphError> {
        let mut declared = BTreeMap::new();

        for (name, value) in outputs {
            let expr = PropertyExpr::parse(value).map_err(|reason| GraphError::InvalidReference {
                resource: OUTPUTS_SCOPE.to_string(),
                expression: value.to_string(),
                reason,
            })?;

            if let Some(reference) = expr
                .references()
                .into_iter()
                .find(|r| !index.contains_key(r.resource.as_str()))
            {
                return Err(GraphError::UnresolvedReference {
                    resource: OUTPUTS_SCOPE.to_string(),
                    property: name.clone(),
                    reference: reference.to_string(),
                });
            }

            declared.insert(name.clone(), expr);
        }

        Ok(declared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn decl(name: &str, resource_type: &str, properties: Value, depends_on: &[&str]) -> ResourceDecl {
        ResourceDecl {
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            properties: serde_json::from_value(properties).unwrap(),
            depends_on: depends_on.iter().map(ToString::to_string).collect(),
        }
    }

    fn names(graph: &ResourceGraph, order: &[usize]) -> Vec<String> {
        order
            .iter()
            .map(|&i| graph.get(i).unwrap().name().to_string())
            .collect()
    }

    fn todo_stack() -> Vec<ResourceDecl> {
        vec![
            decl(
                "get-todos",
                "aws:lambda:Function",
                json!({"environment": {"TABLE_NAME": "${todo-table.name}"}, "role": "${lambda-role.arn}"}),
                &[],
            ),
            decl("lambda-role", "aws:iam:Role", json!({}), &[]),
            decl(
                "lambda-policy",
                "aws:iam:RolePolicy",
                json!({"role": "${lambda-role.id}", "policy": "allow dynamodb on ${todo-table.arn}"}),
                &[],
            ),
            decl("todo-table", "aws:dynamodb:Table", json!({"hashKey": "id"}), &[]),
            decl(
                "api",
                "aws:apigateway:RestApi",
                json!({"routes": [{"path": "/todos", "target": "${get-todos.arn}"}]}),
                &["lambda-policy"],
            ),
        ]
    }

    #[test]
    fn test_topological_order_is_valid_linearization() {
        let graph = GraphBuilder::new().build(&todo_stack()).unwrap();
        let order = graph.topological_order();
        assert_eq!(order.len(), graph.len());

        let position: HashMap<usize, usize> =
            order.iter().enumerate().map(|(pos, &i)| (i, pos)).collect();
        for i in 0..graph.len() {
            for &producer in graph.producers(i) {
                assert!(position[&producer] < position[&i]);
            }
        }

        assert_eq!(
            names(&graph, &order),
            vec!["lambda-role", "todo-table", "get-todos", "lambda-policy", "api"]
        );
    }

    #[test]
    fn test_order_is_deterministic() {
        let builder = GraphBuilder::new();
        let first = builder.build(&todo_stack()).unwrap().topological_order();
        for _ in 0..10 {
            assert_eq!(builder.build(&todo_stack()).unwrap().topological_order(), first);
        }
    }

    #[test]
    fn test_edges_from_references_and_depends_on() {
        let graph = GraphBuilder::new().build(&todo_stack()).unwrap();
        let api = graph.index_of("api").unwrap();
        assert_eq!(graph.dependency_names(api), vec!["get-todos", "lambda-policy"]);

        let table = graph.index_of("todo-table").unwrap();
        let consumers: Vec<_> = graph
            .consumers(table)
            .iter()
            .map(|&i| graph.get(i).unwrap().name())
            .collect();
        assert_eq!(consumers, vec!["get-todos", "lambda-policy"]);
    }

    #[test]
    fn test_cycle_detected() {
        let resources = vec![
            decl("a", "t", json!({"x": "${b.id}"}), &[]),
            decl("b", "t", json!({"y": "${c.id}"}), &[]),
            decl("c", "t", json!({}), &["a"]),
        ];
        let err = GraphBuilder::new().build(&resources).unwrap_err();
        match err {
            GraphError::Cycle { path } => assert_eq!(path, vec!["a", "b", "c", "a"]),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let resources = vec![decl("a", "t", json!({"x": "${a.id}"}), &[])];
        let err = GraphBuilder::new().build(&resources).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { path } if path == vec!["a", "a"]));
    }

    #[test]
    fn test_unresolved_reference() {
        let resources = vec![decl("fn", "t", json!({"table": "${missing.name}"}), &[])];
        let err = GraphBuilder::new().build(&resources).unwrap_err();
        match err {
            GraphError::UnresolvedReference {
                resource,
                property,
                reference,
            } => {
                assert_eq!(resource, "fn");
                assert_eq!(property, "table");
                assert_eq!(reference, "${missing.name}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_depends_on() {
        let resources = vec![decl("fn", "t", json!({}), &["ghost"])];
        assert!(matches!(
            GraphBuilder::new().build(&resources),
            Err(GraphError::UnresolvedReference { property, .. }) if property == "depends_on"
        ));
    }

    #[test]
    fn test_duplicate_resource() {
        let resources = vec![decl("a", "t", json!({}), &[]), decl("a", "t", json!({}), &[])];
        assert!(matches!(
            GraphBuilder::new().build(&resources),
            Err(GraphError::DuplicateResource { name }) if name == "a"
        ));
    }

    #[test]
    fn test_invalid_reference() {
        let resources = vec![decl("a", "t", json!({"x": "${b}"}), &[])];
        assert!(matches!(
            GraphBuilder::new().build(&resources),
            Err(GraphError::InvalidReference { resource, .. }) if resource == "a"
        ));
    }

    #[test]
    fn test_stack_outputs_are_checked() {
        let mut outputs = BTreeMap::new();
        outputs.insert("url".to_string(), json!("https://${api.id}.example.com"));
        let config = StackConfig {
            project: crate::config::ProjectConfig {
                name: "app".into(),
                environment: "dev".into(),
                description: None,
            },
            state: crate::config::StateConfig::default(),
            execution: crate::config::ExecutionConfig::default(),
            providers: BTreeMap::new(),
            resources: vec![decl("web", "t", json!({}), &[])],
            outputs,
            compliance: None,
        };

        let err = GraphBuilder::new().build_stack(&config).unwrap_err();
        assert!(matches!(err, GraphError::UnresolvedReference { resource, .. } if resource == "outputs"));
    }
}
