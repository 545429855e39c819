//! Text and JSON rendering of plans, reports and snapshots.

use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::Duration;
use tabled::{Table, Tabled};

use crate::planner::{ChangeKind, ReconcilePlan};
use crate::reconciler::DriftReport;
use crate::state::StateSnapshot;

use super::{NodeReport, NodeStatus, RunReport};

/// Output format for rendered reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Renders engine results for display.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan change row for table display.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "Change")]
    change: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    type_token: String,
    #[tabled(rename = "Details")]
    details: String,
}

/// Node outcome row for table display.
#[derive(Tabled)]
struct NodeRow {
    #[tabled(rename = "#")]
    sequence: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Time")]
    time: String,
}

impl ReportFormatter {
    /// Creates a new formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a reconcile plan.
    #[must_use]
    pub fn format_plan(&self, plan: &ReconcilePlan) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &ReconcilePlan) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan for {}/{}\n\n", plan.project, plan.environment);

        let rows: Vec<ChangeRow> = plan
            .changes
            .iter()
            .filter(|c| c.kind.is_change())
            .map(|c| ChangeRow {
                change: Self::format_change(c.kind),
                resource: c.name.clone(),
                type_token: Self::truncate(&c.type_token, 45),
                details: Self::truncate(
                    &c.details.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
                    50,
                ),
            })
            .collect();

        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to delete, {} unchanged\n",
            plan.count(ChangeKind::Create).to_string().green(),
            plan.count(ChangeKind::Update).to_string().yellow(),
            plan.count(ChangeKind::Replace).to_string().magenta(),
            plan.count(ChangeKind::Delete).to_string().red(),
            plan.count(ChangeKind::Unchanged)
        );
        output
    }

    /// Formats a run report.
    #[must_use]
    pub fn format_report(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => {
                serde_json::to_string_pretty(&ReportJson::from(report)).unwrap_or_default()
            }
            OutputFormat::Text => Self::format_report_text(report),
        }
    }

    fn format_report_text(report: &RunReport) -> String {
        let status = if report.is_success() {
            format!("{} {} succeeded", "✓".green(), report.operation)
        } else {
            format!("{} {} failed", "✗".red(), report.operation)
        };

        let mut output = format!("{status} for {}/{}\n\n", report.project, report.environment);

        let mut nodes: Vec<_> = report.nodes.iter().collect();
        nodes.sort_by_key(|n| (n.sequence.is_none(), n.sequence));
        let rows: Vec<NodeRow> = nodes
            .iter()
            .map(|n| NodeRow {
                sequence: n.sequence.map_or_else(|| String::from("-"), |s| s.to_string()),
                resource: n.name.clone(),
                status: Self::format_status(n.status),
                id: Self::truncate(n.id.as_deref().unwrap_or("-"), 40),
                time: format!("{:.1}s", Duration::from_millis(n.duration_ms).as_secs_f64()),
            })
            .collect();
        if !rows.is_empty() {
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let _ = write!(
            output,
            "\nResources: {} created, {} updated, {} replaced, {} deleted, {} unchanged, \
             {} failed, {} skipped\n",
            report.count(NodeStatus::Created),
            report.count(NodeStatus::Updated),
            report.count(NodeStatus::Replaced),
            report.count(NodeStatus::Deleted),
            report.count(NodeStatus::Unchanged),
            report.count(NodeStatus::Failed),
            report.count(NodeStatus::Skipped)
        );

        let errors: Vec<_> = report.nodes.iter().filter(|n| n.error.is_some()).collect();
        if !errors.is_empty() || !report.output_errors.is_empty() {
            let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
            for node in errors {
                let _ = writeln!(
                    output,
                    "   - {}: {}",
                    node.name,
                    node.error.as_deref().unwrap_or_default()
                );
            }
            for (name, error) in &report.output_errors {
                let _ = writeln!(output, "   - output {name}: {error}");
            }
        }

        let outputs = report.redacted_outputs();
        if !outputs.is_empty() {
            output.push_str("\nOutputs:\n");
            for (name, value) in &outputs {
                let shown = value.as_str().map_or_else(|| value.to_string(), str::to_string);
                let _ = writeln!(output, "   {name}: {shown}");
            }
        }

        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    format!("{} No drift detected - state is converged.\n", "✓".green())
                } else {
                    let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                    for resource in &report.drifted_resources {
                        let _ = writeln!(output, "   - {resource}");
                    }
                    for resource in &report.missing_resources {
                        let _ = writeln!(output, "   - {resource} (missing)");
                    }
                    for resource in &report.undeployed_resources {
                        let _ = writeln!(output, "   - {resource} (not deployed)");
                    }
                    let _ = write!(
                        output,
                        "\n{}/{} recorded resources have drifted.\n",
                        report.drifted_resources.len() + report.missing_resources.len(),
                        report.total_resources
                    );
                    output
                }
            }
        }
    }

    /// Formats a snapshot summary.
    #[must_use]
    pub fn format_snapshot(&self, snapshot: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(snapshot).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\nState: {}/{}\n\n",
                    snapshot.project, snapshot.environment
                );
                let _ = writeln!(output, "   Version: {}", snapshot.version);
                let _ = writeln!(output, "   Serial: {}", snapshot.serial);
                let _ = writeln!(output, "   Last updated: {}", snapshot.last_updated);
                let _ = writeln!(output, "   Resources: {}", snapshot.resources.len());
                if !snapshot.pending_deletes.is_empty() {
                    let pending = snapshot.pending_deletes.len();
                    let _ = writeln!(output, "   Pending deletes: {pending}");
                }

                if !snapshot.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", snapshot.history.len());
                    for entry in snapshot.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats a change kind with color.
    fn format_change(kind: ChangeKind) -> String {
        match kind {
            ChangeKind::Create => "+create".green().to_string(),
            ChangeKind::Update => "~update".yellow().to_string(),
            ChangeKind::Replace => "+-replace".magenta().to_string(),
            ChangeKind::Delete => "-delete".red().to_string(),
            ChangeKind::Unchanged => "unchanged".dimmed().to_string(),
        }
    }

    /// Formats a node status with color.
    fn format_status(status: NodeStatus) -> String {
        match status {
            NodeStatus::Created => "created".green().to_string(),
            NodeStatus::Updated => "updated".yellow().to_string(),
            NodeStatus::Replaced => "replaced".magenta().to_string(),
            NodeStatus::Deleted => "deleted".red().to_string(),
            NodeStatus::Unchanged => "unchanged".dimmed().to_string(),
            NodeStatus::Failed => "failed".red().bold().to_string(),
            NodeStatus::Skipped => "skipped".yellow().to_string(),
        }
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

// JSON serialization helpers

#[derive(Serialize)]
struct ReportJson<'a> {
    project: &'a str,
    environment: &'a str,
    operation: String,
    success: bool,
    exit_code: i32,
    serial: u64,
    started_at: String,
    finished_at: String,
    nodes: &'a [NodeReport],
    outputs: BTreeMap<String, serde_json::Value>,
    output_errors: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a RunReport> for ReportJson<'a> {
    fn from(report: &'a RunReport) -> Self {
        Self {
            project: &report.project,
            environment: &report.environment,
            operation: report.operation.to_string(),
            success: report.is_success(),
            exit_code: report.exit_code(),
            serial: report.serial,
            started_at: report.started_at.to_rfc3339(),
            finished_at: report.finished_at.to_rfc3339(),
            nodes: &report.nodes,
            outputs: report.redacted_outputs(),
            output_errors: &report.output_errors,
        }
    }
}
