// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

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
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # infragraph
//!
//! A declarative, idempotent infrastructure engine: declare typed resources
//! wired together by deferred outputs, and let the engine work out the rest.
//!
//! ## Overview
//!
//! infragraph lets you:
//!
//! - Declare resources in Rust through a [`Deployment`] or in a YAML stack file
//! - Wire resources together with deferred [`Output`] cells
//! - Create, update, replace and delete resources in dependency order,
//!   concurrently where the graph allows
//! - Retry transient provider failures with bounded backoff
//! - Persist what was applied after every provider operation
//!
//! ## Architecture
//!
//! The engine is built around **state reconciliation**:
//!
//! 1. **Desired State**: the declared resource graph
//! 2. **Recorded State**: the snapshot of the last runs
//! 3. **Reconciler**: diffs the two and drives a provider until they match
//!
//! ## Modules
//!
//! - [`output`]: Deferred value cells and input property trees
//! - [`deployment`]: Resource declarations and the deployment context
//! - [`graph`]: Dependency graph construction and ordering
//! - [`provider`]: Provider contract, routing and retries
//! - [`state`]: Snapshot storage backends (local, S3) and the run journal
//! - [`planner`]: Diffing, step planning and scheduling
//! - [`reconciler`]: The reconciliation engine
//! - [`report`]: Run reports and their rendering
//! - [`config`]: Stack file parsing and validation
//! - [`telemetry`]: Logging setup
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: node-app
//!   environment: dev
//!
//! resources:
//!   - name: rg
//!     type: "azure-native:resources:ResourceGroup"
//!     properties:
//!       location: westeurope
//!   - name: workspace
//!     type: "azure-native:operationalinsights:Workspace"
//!     properties:
//!       resourceGroupName: "${rg.name}"
//!       retentionInDays: 30
//!
//! outputs:
//!   workspaceId: "${workspace.id}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod deployment;
pub mod error;
pub mod graph;
pub mod output;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod report;
pub mod state;
pub mod telemetry;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackConfig};
pub use deployment::{Deployment, ResourceHandle, ResourceNode, ResourceOptions};
pub use error::{InfraError, Result};
pub use graph::DependencyGraph;
pub use output::{Input, Output, OutputResolver, Properties};
pub use planner::{ChangeKind, DiffEngine, ReconcilePlan, Scheduler};
pub use provider::{
    HttpProvider, InMemoryProvider, Provider, ProviderInvoker, ProviderRegistry, RetryPolicy,
    TypeRegistry,
};
pub use reconciler::{DriftReport, Reconciler};
pub use report::{NodeStatus, OutputFormat, ReportFormatter, RunReport};
pub use state::{LocalStateStore, S3StateStore, SnapshotJournal, StateSnapshot, StateStore};
pub use telemetry::init_logging;
