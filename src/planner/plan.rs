//! Reconcile plan types and construction.
//!
//! A plan holds one classified change per resource and the provider steps
//! that carry them out. Each step lists the steps it must wait for.
//!
//! Steps fall into three layers, and a step only ever waits for steps of
//! its own or an earlier layer, which keeps the step graph acyclic:
//!
//! 1. deletions of delete-before-create replacements, dependents first;
//! 2. creates, updates and replacement creates, in dependency order;
//! 3. deletions of removed resources and of create-before-delete
//!    replacements, after every dependent moved off them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::graph::DependencyGraph;
use crate::provider::ReplacementPolicy;
use crate::state::PendingDelete;

use super::diff::{ChangeKind, PropertyDiff};

/// A complete reconcile plan.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcilePlan {
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// One entry per declared or recorded resource.
    pub changes: Vec<NodeChange>,
    /// Provider steps.
    pub steps: Vec<PlanStep>,
}

/// The classified change of one resource.
#[derive(Debug, Clone, Serialize)]
pub struct NodeChange {
    /// Logical name.
    pub name: String,
    /// Type token.
    pub type_token: String,
    /// Classification.
    pub kind: ChangeKind,
    /// Property-level details.
    pub details: Vec<PropertyDiff>,
    /// Ordering of a replacement.
    pub replacement: Option<ReplacementPolicy>,
}

/// A single provider step.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    /// Step type.
    pub kind: StepKind,
    /// Logical name of the resource.
    pub resource: String,
    /// Type token.
    pub type_token: String,
    /// Identity of the instance to delete, for pending deletes.
    pub target_id: Option<String>,
    /// Indices of the steps that must succeed first.
    pub dependencies: Vec<usize>,
}

/// Types of steps in a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Create a new resource.
    Create,
    /// Update a resource in place.
    Update,
    /// Create the new instance of a replaced resource.
    CreateReplacement,
    /// Delete the old instance of a replaced resource.
    DeleteReplaced,
    /// Delete a resource that is no longer declared.
    Delete,
    /// Delete an instance left over by an interrupted replacement.
    DeletePending,
}

impl ReconcilePlan {
    /// Builds the steps for `changes`.
    ///
    /// `desired` is the graph being applied, `prior` the graph recorded in
    /// the snapshot. `pending` are leftover instances to delete.
    #[must_use]
    pub fn build(
        project: &str,
        environment: &str,
        changes: Vec<NodeChange>,
        desired: &DependencyGraph,
        prior: &DependencyGraph,
        pending: &[PendingDelete],
    ) -> Self {
        let by_name: HashMap<&str, &NodeChange> =
            changes.iter().map(|c| (c.name.as_str(), c)).collect();
        let mut steps: Vec<PlanStep> = Vec::new();

        let push = |steps: &mut Vec<PlanStep>,
                    kind: StepKind,
                    change: &NodeChange,
                    mut dependencies: Vec<usize>| {
            dependencies.sort_unstable();
            dependencies.dedup();
            steps.push(PlanStep {
                kind,
                resource: change.name.clone(),
                type_token: change.type_token.clone(),
                target_id: None,
                dependencies,
            });
            steps.len() - 1
        };

        let prior_order = prior.reverse_topological_order();

        let mut early_deletes: HashMap<String, usize> = HashMap::new();
        for name in &prior_order {
            let Some(&change) = by_name.get(name.as_str()) else {
                continue;
            };
            if change.kind == ChangeKind::Replace
                && change.replacement == Some(ReplacementPolicy::DeleteBeforeCreate)
            {
                let dependencies = prior
                    .dependents(name)
                    .into_iter()
                    .filter_map(|d| early_deletes.get(d).copied())
                    .collect();
                let index = push(&mut steps, StepKind::DeleteReplaced, change, dependencies);
                early_deletes.insert(name.clone(), index);
            }
        }

        let mut producing: HashMap<String, usize> = HashMap::new();
        for name in desired.topological_order() {
            let Some(&change) = by_name.get(name.as_str()) else {
                continue;
            };
            let kind = match change.kind {
                ChangeKind::Create => StepKind::Create,
                ChangeKind::Update => StepKind::Update,
                ChangeKind::Replace => StepKind::CreateReplacement,
                ChangeKind::Unchanged | ChangeKind::Delete => continue,
            };
            let mut dependencies: Vec<usize> = desired
                .dependencies(&name)
                .into_iter()
                .filter_map(|d| producing.get(d).copied())
                .collect();
            dependencies.extend(early_deletes.get(&name).copied());
            let index = push(&mut steps, kind, change, dependencies);
            producing.insert(name, index);
        }

        let mut teardown: HashMap<String, usize> = HashMap::new();
        for name in &prior_order {
            let Some(&change) = by_name.get(name.as_str()) else {
                continue;
            };
            let mut dependencies: Vec<usize> = match (change.kind, change.replacement) {
                (ChangeKind::Delete, _) => Vec::new(),
                (ChangeKind::Replace, Some(ReplacementPolicy::CreateBeforeDelete)) => {
                    let mut deps: Vec<usize> = producing.get(name).copied().into_iter().collect();
                    deps.extend(
                        desired
                            .dependents(name)
                            .into_iter()
                            .filter_map(|d| producing.get(d).copied()),
                    );
                    deps
                }
                _ => continue,
            };
            for dependent in prior.dependents(name) {
                dependencies.extend(teardown.get(dependent).copied());
                dependencies.extend(producing.get(dependent).copied());
            }
            let kind = if change.kind == ChangeKind::Delete {
                StepKind::Delete
            } else {
                StepKind::DeleteReplaced
            };
            let index = push(&mut steps, kind, change, dependencies);
            teardown.insert(name.clone(), index);
        }

        for leftover in pending {
            steps.push(PlanStep {
                kind: StepKind::DeletePending,
                resource: leftover.name.clone(),
                type_token: leftover.type_token.clone(),
                target_id: Some(leftover.id.clone()),
                dependencies: Vec::new(),
            });
        }

        Self {
            project: project.to_string(),
            environment: environment.to_string(),
            created_at: Utc::now(),
            changes,
            steps,
        }
    }

    /// Returns the change of a resource.
    #[must_use]
    pub fn change(&self, name: &str) -> Option<&NodeChange> {
        self.changes.iter().find(|c| c.name == name)
    }

    /// Number of resources with the given classification.
    #[must_use]
    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }

    /// Returns true if the plan calls any mutating provider operation.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Returns true if the plan has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of steps.
    #[must_use]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Steps that can start immediately.
    #[must_use]
    pub fn ready_steps(&self) -> Vec<&PlanStep> {
        self.steps
            .iter()
            .filter(|s| s.dependencies.is_empty())
            .collect()
    }

    /// Index of the first step of `kind` for `resource`.
    #[must_use]
    pub fn step_index(&self, kind: StepKind, resource: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.kind == kind && s.resource == resource)
    }
}

impl PlanStep {
    /// Returns a human-readable description of the step.
    #[must_use]
    pub fn description(&self) -> String {
        match self.kind {
            StepKind::Create => format!("Create '{}'", self.resource),
            StepKind::Update => format!("Update '{}'", self.resource),
            StepKind::CreateReplacement => format!("Create replacement for '{}'", self.resource),
            StepKind::DeleteReplaced => format!("Delete replaced '{}'", self.resource),
            StepKind::Delete => format!("Delete '{}'", self.resource),
            StepKind::DeletePending => format!(
                "Delete leftover '{}' ({})",
                self.resource,
                self.target_id.as_deref().unwrap_or("unknown")
            ),
        }
    }

    /// Returns true if the step deletes something.
    #[must_use]
    pub const fn is_delete(&self) -> bool {
        matches!(
            self.kind,
            StepKind::DeleteReplaced | StepKind::Delete | StepKind::DeletePending
        )
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::CreateReplacement => "create-replacement",
            Self::DeleteReplaced => "delete-replaced",
            Self::Delete => "delete",
            Self::DeletePending => "delete-pending",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlanStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.resource)?;
        if !self.dependencies.is_empty() {
            let deps: Vec<String> = self.dependencies.iter().map(ToString::to_string).collect();
            write!(f, " (after {})", deps.join(", "))?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ReconcilePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.steps.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(
            f,
            "Plan for {}/{} ({} steps):",
            self.project,
            self.environment,
            self.steps.len()
        )?;
        for (i, step) in self.steps.iter().enumerate() {
            writeln!(f, "  {i}. {step}")?;
        }
        Ok(())
    }
}
