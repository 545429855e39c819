//! Declared deployments.
//!
//! This module provides the explicit deployment context through which
//! resources are declared, and the resource node types the rest of the
//! engine consumes.

mod context;
mod loader;
mod resource;

pub use context::Deployment;
pub(crate) use context::DeploymentParts;
pub use resource::{ResourceHandle, ResourceNode, ResourceOptions};
