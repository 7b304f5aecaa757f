//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! plans, run summaries and state in text or JSON.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::compliance::{ComplianceReport, ControlStatus};
use crate::engine::RunSummary;
use crate::graph::{NodeStatus, ResourceGraph};
use crate::planner::{OperationKind, OperationOutcome, Plan};
use crate::state::StackState;

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Graph node row for table display.
#[derive(Tabled)]
struct GraphRow {
    #[tabled(rename = "#")]
    order: usize,
    #[tabled(rename = "Resource")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
}

/// Resource row for run summaries.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
}

/// Recorded resource row for state listings.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
    #[tabled(rename = "Depends on")]
    dependencies: String,
    #[tabled(rename = "Last applied")]
    last_applied: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true when writing JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn json<T: Serialize>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - resources are up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan");
        if !plan.stack_hash.is_empty() {
            let _ = writeln!(output, "   Stack hash: {}", Self::short(&plan.stack_hash));
        }
        output.push('\n');

        let rows: Vec<PlanRow> = plan
            .operations
            .iter()
            .enumerate()
            .map(|(i, op)| PlanRow {
                index: i + 1,
                action: Self::format_kind(op.kind),
                resource: op.id.name.clone(),
                resource_type: op.id.resource_type.clone(),
                reason: Self::truncate(&op.reason, 40),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanges:\n");
            for op in &plan.operations {
                let _ = writeln!(output, "  {} {}", Self::format_kind(op.kind), op.id);
                for detail in &op.details {
                    let _ = writeln!(output, "      {detail}");
                }
                for unknown in &op.unknown {
                    let _ = writeln!(output, "      {unknown}: {}", crate::graph::UNKNOWN.dimmed());
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} unchanged\n",
            plan.count(OperationKind::Create).to_string().green(),
            plan.count(OperationKind::Update).to_string().yellow(),
            plan.count(OperationKind::Delete).to_string().red(),
            plan.unchanged().len()
        );

        output
    }

    /// Formats the resource graph in apply order.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph) -> String {
        let order = graph.topological_order();
        match self.format {
            OutputFormat::Json => {
                let nodes: Vec<GraphNodeJson<'_>> = order
                    .iter()
                    .filter_map(|&i| {
                        graph.get(i).map(|node| GraphNodeJson {
                            name: node.name(),
                            resource_type: node.resource_type(),
                            depends_on: graph.dependency_names(i),
                            used_by: graph
                                .consumers(i)
                                .iter()
                                .filter_map(|&c| graph.get(c).map(|n| n.name()))
                                .collect(),
                        })
                    })
                    .collect();
                Self::json(&nodes)
            }
            OutputFormat::Text => {
                if graph.is_empty() {
                    return String::from("No resources declared.\n");
                }
                let rows: Vec<GraphRow> = order
                    .iter()
                    .enumerate()
                    .filter_map(|(position, &i)| {
                        graph.get(i).map(|node| GraphRow {
                            order: position + 1,
                            name: node.name().to_string(),
                            resource_type: node.resource_type().to_string(),
                            depends_on: graph.dependency_names(i).join(", "),
                        })
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats the outcome of an apply or destroy run.
    #[must_use]
    pub fn format_summary(&self, summary: &RunSummary) -> String {
        match self.format {
            OutputFormat::Json => Self::json(summary),
            OutputFormat::Text => Self::format_summary_text(summary),
        }
    }

    fn format_summary_text(summary: &RunSummary) -> String {
        let execution = &summary.execution;
        let headline = if execution.cancelled {
            format!("{} {} cancelled", "✗".red(), summary.operation)
        } else if summary.success() {
            format!("{} {} complete", "✓".green(), summary.operation)
        } else {
            format!("{} {} finished with failures", "✗".red(), summary.operation)
        };

        let mut output = format!("\n{headline} ({})\n\n", summary.run_id);
        let _ = writeln!(output, "   Created: {}", execution.created);
        let _ = writeln!(output, "   Updated: {}", execution.updated);
        let _ = writeln!(output, "   Deleted: {}", execution.deleted);
        let _ = writeln!(output, "   Unchanged: {}", execution.unchanged);
        let _ = writeln!(output, "   Failed: {}", execution.failed);
        let _ = writeln!(output, "   Skipped: {}", execution.skipped);
        if execution.not_attempted > 0 {
            let _ = writeln!(output, "   Not attempted: {}", execution.not_attempted);
        }

        let failures = execution.failures();
        if !failures.is_empty() {
            let _ = write!(output, "\n{} Failures:\n", "⚠".yellow());
            for report in failures {
                match &report.outcome {
                    OperationOutcome::Skipped { reason, path } => {
                        let _ = writeln!(output, "   - {} skipped: {reason}", report.id.name);
                        let _ = writeln!(output, "       path: {}", path.join(" -> "));
                    }
                    outcome => {
                        let _ = writeln!(output, "   - {} {}: {outcome}", report.kind, report.id.name);
                    }
                }
            }
        }

        if !summary.resources.is_empty() {
            let rows: Vec<ResourceRow> = summary
                .resources
                .iter()
                .map(|r| ResourceRow {
                    name: r.name.clone(),
                    resource_type: r.resource_type.clone(),
                    status: Self::format_status(&r.status),
                    physical_id: r.physical_id.clone().unwrap_or_default(),
                })
                .collect();
            let _ = write!(output, "\n{}\n", Table::new(rows));
        }

        if !summary.outputs.is_empty() {
            output.push_str("\nOutputs:\n");
            for (name, value) in &summary.outputs {
                let _ = writeln!(output, "   {name} = {}", crate::planner::render(value));
            }
        }

        if let Some(report) = &summary.compliance {
            output.push_str(&Self::format_compliance_text(report));
        }

        output
    }

    fn format_compliance_text(report: &ComplianceReport) -> String {
        let marker = if report.has_failures() {
            "⚠".yellow()
        } else {
            "✓".green()
        };
        let mut output = format!("\n{marker} Compliance: {report}\n");
        for result in &report.results {
            let status = match result.status {
                ControlStatus::Passed => "passed".green(),
                ControlStatus::Failed => "failed".red(),
                ControlStatus::Skipped => "skipped".dimmed(),
            };
            let _ = writeln!(output, "   [{status}] {} {}", result.id, result.title);
            for failure in &result.failures {
                let _ = writeln!(
                    output,
                    "       {}.{}: {}",
                    failure.resource, failure.attribute, failure.message
                );
            }
        }
        output
    }

    /// Formats a state document summary.
    #[must_use]
    pub fn format_state(&self, state: &StackState) -> String {
        match self.format {
            OutputFormat::Json => Self::json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Stack hash: {}", Self::short(&state.stack_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}", state.records.len());

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                        if let Some(error) = &entry.error {
                            let _ = writeln!(output, "         {error}");
                        }
                    }
                }

                output
            }
        }
    }

    /// Formats the recorded resources.
    #[must_use]
    pub fn format_records(&self, state: &StackState) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&state.records),
            OutputFormat::Text => {
                if state.is_empty() {
                    return String::from("No resources recorded.\n");
                }
                let rows: Vec<RecordRow> = state
                    .records
                    .iter()
                    .map(|(name, record)| RecordRow {
                        name: name.clone(),
                        resource_type: record.id.resource_type.clone(),
                        physical_id: Self::truncate(&record.physical_id, 40),
                        dependencies: record.dependencies.join(", "),
                        last_applied: record.last_applied.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats an operation kind with color.
    fn format_kind(kind: OperationKind) -> String {
        match kind {
            OperationKind::Create => "+create".green().to_string(),
            OperationKind::Update => "~update".yellow().to_string(),
            OperationKind::Delete => "-delete".red().to_string(),
        }
    }

    /// Formats a node status with color.
    fn format_status(status: &NodeStatus) -> String {
        match status {
            NodeStatus::Created | NodeStatus::Updated | NodeStatus::Deleted => {
                status.to_string().green().to_string()
            }
            NodeStatus::Unchanged => status.to_string().dimmed().to_string(),
            NodeStatus::Pending => "pending".yellow().to_string(),
            NodeStatus::Failed { path, .. } if !path.is_empty() => "skipped".red().to_string(),
            NodeStatus::Failed { .. } => "failed".red().to_string(),
        }
    }

    fn short(hash: &str) -> &str {
        hash.get(..8).unwrap_or(hash)
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

#[derive(Serialize)]
struct GraphNodeJson<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    resource_type: &'a str,
    depends_on: Vec<String>,
    used_by: Vec<&'a str>,
}
