//! Dependency graph.
//!
//! This module recovers the dependency graph of a deployment from the
//! provenance of its inputs, rejects cycles, and produces creation and
//! deletion orders.

mod builder;

pub use builder::DependencyGraph;
