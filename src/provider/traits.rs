//! The provider contract.
//!
//! A provider is the opaque control plane behind a package of resource types.
//! The engine only ever talks to it through [`Provider`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::ProviderError;

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// A request for a single resource operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Type token, `package:module:Type`.
    pub type_token: String,
    /// Logical name of the resource.
    pub name: String,
    /// Provider identity, for operations on an existing resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Desired input properties.
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Outputs recorded by the previous successful operation.
    #[serde(default)]
    pub old_outputs: Map<String, Value>,
    /// Key shared by every attempt of one create, so a provider can answer a
    /// retry of a create it already committed with the same instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl ResourceRequest {
    /// Creates a request for a new resource.
    #[must_use]
    pub fn new(type_token: &str, name: &str, properties: Map<String, Value>) -> Self {
        Self {
            type_token: type_token.to_string(),
            name: name.to_string(),
            id: None,
            properties,
            old_outputs: Map::new(),
            idempotency_key: None,
        }
    }

    /// Tags the request with a key that identifies the logical operation
    /// across retries.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Targets an existing resource.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Attaches the previously recorded outputs.
    #[must_use]
    pub fn with_old_outputs(mut self, outputs: Map<String, Value>) -> Self {
        self.old_outputs = outputs;
        self
    }
}

/// The provider's answer to a create, read or update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Provider identity of the resource.
    pub id: String,
    /// Output properties.
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

/// Operations the engine performs against a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Create a resource.
    Create,
    /// Read a resource's live outputs.
    Read,
    /// Update a resource in place.
    Update,
    /// Delete a resource.
    Delete,
    /// Call a provider function.
    Invoke,
}

impl Operation {
    /// Returns the wire name of the operation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Invoke => "invoke",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource provider.
///
/// Implementations classify their failures through [`ProviderError`]: the
/// invoker retries transient variants and fails the node on the rest.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource and returns its identity and outputs.
    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse>;

    /// Reads the live state of an existing resource.
    async fn read(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse>;

    /// Updates an existing resource in place.
    async fn update(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse>;

    /// Deletes an existing resource.
    async fn delete(&self, request: &ResourceRequest) -> ProviderResult<()>;

    /// Calls a provider function such as a credentials lookup.
    async fn invoke(&self, token: &str, args: &Value) -> ProviderResult<Value>;
}
