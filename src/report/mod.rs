//! Run reports.
//!
//! A report lists what happened to every resource in a run, the resolved
//! stack outputs, and the process exit code that summarizes it.

mod format;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::state::RunOperation;

pub use format::{OutputFormat, ReportFormatter};

/// Placeholder shown instead of secret values.
pub const SECRET_PLACEHOLDER: &str = "[secret]";

/// Outcome of one resource in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// A new resource was created.
    Created,
    /// The resource was updated in place.
    Updated,
    /// A new instance replaced the old one.
    Replaced,
    /// The resource was deleted.
    Deleted,
    /// Nothing needed to change.
    Unchanged,
    /// A provider operation failed.
    Failed,
    /// The resource was not touched because something it needed failed.
    Skipped,
}

/// What happened to one resource.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    /// Logical name.
    pub name: String,
    /// Type token.
    #[serde(rename = "type")]
    pub type_token: String,
    /// Outcome.
    pub status: NodeStatus,
    /// Provider identity after the run, if any.
    pub id: Option<String>,
    /// Failure or skip reason.
    pub error: Option<String>,
    /// Launch order of the resource's first step.
    pub sequence: Option<usize>,
    /// Time spent in provider steps, in milliseconds.
    pub duration_ms: u64,
}

/// Report of an apply or destroy run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Type of run.
    pub operation: RunOperation,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Per-resource outcomes.
    pub nodes: Vec<NodeReport>,
    /// Resolved stack outputs.
    pub outputs: BTreeMap<String, Value>,
    /// Stack outputs that could not be resolved.
    pub output_errors: BTreeMap<String, String>,
    /// Names of outputs holding secrets.
    pub secret_outputs: BTreeSet<String>,
    /// Snapshot serial after the run.
    pub serial: u64,
}

impl NodeReport {
    /// Creates a report entry.
    #[must_use]
    pub fn new(name: &str, type_token: &str, status: NodeStatus) -> Self {
        Self {
            name: name.to_string(),
            type_token: type_token.to_string(),
            status,
            id: None,
            error: None,
            sequence: None,
            duration_ms: 0,
        }
    }

    /// Sets the provider identity.
    #[must_use]
    pub fn with_id(mut self, id: Option<String>) -> Self {
        self.id = id;
        self
    }

    /// Sets the failure or skip reason.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sets launch order and time spent.
    #[must_use]
    pub fn with_timing(mut self, sequence: Option<usize>, duration: Duration) -> Self {
        self.sequence = sequence;
        self.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

impl RunReport {
    /// Creates an empty report for a run starting now.
    #[must_use]
    pub fn new(project: &str, environment: &str, operation: RunOperation) -> Self {
        let now = Utc::now();
        Self {
            project: project.to_string(),
            environment: environment.to_string(),
            operation,
            started_at: now,
            finished_at: now,
            nodes: Vec::new(),
            outputs: BTreeMap::new(),
            output_errors: BTreeMap::new(),
            secret_outputs: BTreeSet::new(),
            serial: 0,
        }
    }

    /// Adds a resource outcome.
    pub fn push(&mut self, node: NodeReport) {
        self.nodes.push(node);
    }

    /// Marks the report finished.
    pub fn finish(&mut self, serial: u64) {
        self.serial = serial;
        self.finished_at = Utc::now();
    }

    /// Returns the outcome of a resource.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Returns the status of a resource.
    #[must_use]
    pub fn status(&self, name: &str) -> Option<NodeStatus> {
        self.node(name).map(|n| n.status)
    }

    /// Number of resources with `status`.
    #[must_use]
    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    /// Resources that failed.
    #[must_use]
    pub fn failed(&self) -> Vec<&NodeReport> {
        self.nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Failed)
            .collect()
    }

    /// Names of resources the run changed.
    #[must_use]
    pub fn changed_resources(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| {
                matches!(
                    n.status,
                    NodeStatus::Created
                        | NodeStatus::Updated
                        | NodeStatus::Replaced
                        | NodeStatus::Deleted
                )
            })
            .map(|n| n.name.clone())
            .collect()
    }

    /// Returns true if every resource and output succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.nodes
            .iter()
            .all(|n| !matches!(n.status, NodeStatus::Failed | NodeStatus::Skipped))
            && self.output_errors.is_empty()
    }

    /// Process exit code: 0 on success, 1 if anything failed or was skipped.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.is_success())
    }

    /// First failure, for history entries.
    #[must_use]
    pub fn error_summary(&self) -> Option<String> {
        self.failed()
            .first()
            .map(|n| format!("{}: {}", n.name, n.error.as_deref().unwrap_or("failed")))
            .or_else(|| {
                self.output_errors
                    .iter()
                    .next()
                    .map(|(name, err)| format!("output {name}: {err}"))
            })
            .or_else(|| {
                self.nodes
                    .iter()
                    .find(|n| n.status == NodeStatus::Skipped)
                    .map(|n| format!("{}: {}", n.name, n.error.as_deref().unwrap_or("skipped")))
            })
    }

    /// Outputs with secret values masked.
    #[must_use]
    pub fn redacted_outputs(&self) -> BTreeMap<String, Value> {
        self.outputs
            .iter()
            .map(|(name, value)| {
                let shown = if self.secret_outputs.contains(name) {
                    Value::String(SECRET_PLACEHOLDER.to_string())
                } else {
                    value.clone()
                };
                (name.clone(), shown)
            })
            .collect()
    }

    /// Time the run took.
    #[must_use]
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Replaced => "replaced",
            Self::Deleted => "deleted",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.is_success() { "succeeded" } else { "failed" };
        writeln!(
            f,
            "{} of {}/{} {status}:",
            self.operation, self.project, self.environment
        )?;
        writeln!(f, "  Created: {}", self.count(NodeStatus::Created))?;
        writeln!(f, "  Updated: {}", self.count(NodeStatus::Updated))?;
        writeln!(f, "  Replaced: {}", self.count(NodeStatus::Replaced))?;
        writeln!(f, "  Deleted: {}", self.count(NodeStatus::Deleted))?;
        writeln!(f, "  Unchanged: {}", self.count(NodeStatus::Unchanged))?;
        writeln!(f, "  Failed: {}", self.count(NodeStatus::Failed))?;
        writeln!(f, "  Skipped: {}", self.count(NodeStatus::Skipped))?;

        for node in self.nodes.iter().filter(|n| n.error.is_some()) {
            writeln!(
                f,
                "    - {} ({}): {}",
                node.name,
                node.status,
                node.error.as_deref().unwrap_or_default()
            )?;
        }
        Ok(())
    }
}
