//! Provider invocation.
//!
//! This module defines the provider contract and everything between the
//! engine and a provider:
//! - Routing of type tokens to providers
//! - Retries with bounded exponential backoff and cancellation
//! - Per-type replacement rules
//! - An HTTP backend and an in-memory backend

mod http;
mod invoker;
mod memory;
mod registry;
mod schema;
mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use http::HttpProvider;
pub use invoker::{ProviderInvoker, RetryPolicy};
pub use memory::{FunctionHandler, InMemoryProvider, OutputHook, StoredResource};
pub use registry::{package_of, ProviderRegistry};
pub use schema::{ReplacementPolicy, TypeRegistry, TypeSpec};
pub use traits::{Operation, Provider, ProviderResponse, ProviderResult, ResourceRequest};
