// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge
//!
//! A declarative resource-graph engine: describe resources and how they
//! reference each other, and converge recorded state to that description.
//!
//! ## Overview
//!
//! A stack file declares resources whose properties may reference the
//! outputs of other resources (`${table.name}`). Converge:
//!
//! - Builds an acyclic dependency graph from those references
//! - Compares the graph with recorded state and plans creates, updates and deletes
//! - Executes the plan in dependency order with bounded parallelism
//! - Persists each result as soon as it settles, under a run lock
//! - Evaluates compliance controls over the applied resources
//!
//! ## Architecture
//!
//! 1. **Declaration**: `converge.stack.yaml`, parsed by [`config`]
//! 2. **Graph**: references linked into edges by [`graph`]
//! 3. **Plan**: diffed against recorded [`state`] by [`planner`]
//! 4. **Execution**: provider calls through [`provider`], orchestrated by [`engine`]
//!
//! ## Modules
//!
//! - [`config`]: Stack parsing, validation and hashing
//! - [`graph`]: Property expressions, reference linking, topological ordering
//! - [`planner`]: Diffing, plans and the parallel executor
//! - [`provider`]: Provider capability, local and HTTP providers, registry
//! - [`state`]: State documents, run locks and storage backends (local, S3, memory)
//! - [`compliance`]: Post-apply controls
//! - [`engine`]: Run orchestration
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: todo-app
//!   environment: dev
//!
//! resources:
//!   - name: todo-table
//!     type: aws:dynamodb:Table
//!     properties:
//!       hashKey: id
//!   - name: get-todos
//!     type: aws:lambda:Function
//!     properties:
//!       environment:
//!         TABLE_NAME: "${todo-table.name}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod compliance;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use compliance::{ComplianceReport, ComplianceValidator, ControlSet};
pub use config::{StackConfig, StackHasher, StackParser, StackValidator};
pub use engine::{Engine, RunSummary};
pub use error::{ConvergeError, Result};
pub use graph::{GraphBuilder, ResourceGraph};
pub use planner::{ExecutionReport, Plan, PlanExecutor, Planner};
pub use provider::{HttpProvider, LocalProvider, Provider, ProviderRegistry};
pub use state::{LocalStateStore, MemoryStateStore, RunSession, S3StateStore, StackState, StateStore};
