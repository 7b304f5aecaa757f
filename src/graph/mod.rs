//! Resource graph module.
//!
//! This module turns declared resources into an acyclic dependency graph:
//! - Parsing property values into symbolic expressions
//! - Linking references into consumer-to-producer edges
//! - Cycle detection and deterministic topological ordering

mod builder;
mod dag;
mod node;
mod value;

pub use builder::GraphBuilder;
pub use dag::ResourceGraph;
pub(crate) use dag::kahn_order;
pub use node::{NodeStatus, Outputs, ResourceId, ResourceNode};
pub use value::{PropertyExpr, Reference, Resolved, Segment, UNKNOWN, resolve_properties};
