//! Planning and scheduling.
//!
//! This module classifies every resource against the snapshot, turns the
//! classification into ordered provider steps, and runs those steps with
//! bounded concurrency.

mod diff;
mod plan;
mod scheduler;

pub use diff::{
    effective_inputs, known_inputs, ChangeKind, DiffEngine, PropertyChange, PropertyDiff,
    ResourceDiff,
};
pub use plan::{NodeChange, PlanStep, ReconcilePlan, StepKind};
pub use scheduler::{Scheduler, StepRecord, StepStatus};
