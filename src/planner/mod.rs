//! Planning and execution.
//!
//! This module compares the resource graph with recorded state, produces
//! an ordered plan, and applies it through the providers.

mod diff;
mod plan;
mod executor;

pub use diff::{DiffDetail, diff_properties, render};
pub use plan::{OperationKind, Plan, PlannedOperation, Planner};
pub use executor::{ExecutionReport, OperationOutcome, OperationReport, PlanExecutor};
