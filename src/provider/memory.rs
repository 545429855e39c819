//! In-process provider.
//!
//! Simulates a control plane in memory: identities are generated on create,
//! names are auto-generated from the logical name when not given, and
//! outputs echo the inputs. Used for sandbox runs and tests.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::ProviderError;

use super::registry::package_of;
use super::traits::{Provider, ProviderResponse, ProviderResult, ResourceRequest};

/// A provider function implemented in memory.
pub type FunctionHandler = Arc<dyn Fn(&Value) -> ProviderResult<Value> + Send + Sync>;

/// Computes extra outputs for a resource type (an ingress FQDN, a login
/// server) from the request.
pub type OutputHook = Arc<dyn Fn(&ResourceRequest, &mut Map<String, Value>) + Send + Sync>;

/// A resource held by the in-memory control plane.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResource {
    /// Type token.
    pub type_token: String,
    /// Logical name.
    pub name: String,
    /// Current outputs.
    pub outputs: Map<String, Value>,
    /// Key of the create that made it.
    pub idempotency_key: Option<String>,
}

/// In-memory provider.
#[derive(Default)]
pub struct InMemoryProvider {
    resources: Mutex<BTreeMap<String, StoredResource>>,
    functions: HashMap<String, FunctionHandler>,
    hooks: HashMap<String, OutputHook>,
    calls: AtomicU64,
}

impl fmt::Debug for InMemoryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryProvider")
            .field("resources", &self.resource_count())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl InMemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function, builder style.
    #[must_use]
    pub fn with_function<F>(mut self, token: &str, handler: F) -> Self
    where
        F: Fn(&Value) -> ProviderResult<Value> + Send + Sync + 'static,
    {
        self.functions.insert(token.to_string(), Arc::new(handler));
        self
    }

    /// Registers an output hook for a type, builder style.
    #[must_use]
    pub fn with_output_hook<F>(mut self, type_token: &str, hook: F) -> Self
    where
        F: Fn(&ResourceRequest, &mut Map<String, Value>) + Send + Sync + 'static,
    {
        self.hooks.insert(type_token.to_string(), Arc::new(hook));
        self
    }

    /// Number of live resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.lock().len()
    }

    /// Looks up a live resource by identity.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<StoredResource> {
        self.lock().get(id).cloned()
    }

    /// Identities of every live resource with the given logical name.
    #[must_use]
    pub fn ids_named(&self, name: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, resource)| resource.name == name)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Total number of resource operations served.
    #[must_use]
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Removes a resource behind the engine's back, to simulate drift.
    pub fn forget(&self, id: &str) -> Option<StoredResource> {
        self.lock().remove(id)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, StoredResource>> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outputs_for(&self, request: &ResourceRequest, id: &str, name: &str) -> Map<String, Value> {
        let mut outputs = request.properties.clone();
        outputs.insert(String::from("id"), Value::String(id.to_string()));
        outputs.insert(String::from("name"), Value::String(name.to_string()));
        if let Some(hook) = self.hooks.get(&request.type_token) {
            hook(request, &mut outputs);
        }
        outputs
    }

    fn require_id(request: &ResourceRequest) -> ProviderResult<&str> {
        request
            .id
            .as_deref()
            .ok_or_else(|| ProviderError::Rejected {
                status: 400,
                message: format!("'{}' has no identity", request.name),
            })
    }
}

#[async_trait]
impl Provider for InMemoryProvider {
    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(7).collect();
        let name = request
            .properties
            .get("name")
            .and_then(Value::as_str)
            .map_or_else(|| format!("{}{suffix}", request.name), ToString::to_string);
        let module_type = request
            .type_token
            .strip_prefix(package_of(&request.type_token))
            .unwrap_or(&request.type_token)
            .trim_start_matches(':')
            .replace(':', "/");
        let id = format!("/{module_type}/{name}");

        let mut resources = self.lock();
        if let Some(key) = request.idempotency_key.as_deref()
            && let Some((id, existing)) = resources
                .iter()
                .find(|(_, r)| r.idempotency_key.as_deref() == Some(key))
        {
            debug!("in-memory create {} repeated, returning {id}", request.name);
            return Ok(ProviderResponse {
                id: id.clone(),
                outputs: existing.outputs.clone(),
            });
        }
        if resources.contains_key(&id) {
            return Err(ProviderError::Rejected {
                status: 409,
                message: format!("{id} already exists"),
            });
        }

        let outputs = self.outputs_for(request, &id, &name);
        debug!("in-memory create {} -> {id}", request.name);
        resources.insert(
            id.clone(),
            StoredResource {
                type_token: request.type_token.clone(),
                name: request.name.clone(),
                outputs: outputs.clone(),
                idempotency_key: request.idempotency_key.clone(),
            },
        );
        Ok(ProviderResponse { id, outputs })
    }

    async fn read(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = Self::require_id(request)?;
        self.lock()
            .get(id)
            .map(|resource| ProviderResponse {
                id: id.to_string(),
                outputs: resource.outputs.clone(),
            })
            .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })
    }

    async fn update(&self, request: &ResourceRequest) -> ProviderResult<ProviderResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = Self::require_id(request)?;
        let mut resources = self.lock();
        let current_name = resources
            .get(id)
            .and_then(|r| r.outputs.get("name"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })?;

        let outputs = self.outputs_for(request, id, &current_name);
        if let Some(resource) = resources.get_mut(id) {
            resource.outputs.clone_from(&outputs);
        }
        Ok(ProviderResponse {
            id: id.to_string(),
            outputs,
        })
    }

    async fn delete(&self, request: &ResourceRequest) -> ProviderResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = Self::require_id(request)?;
        self.lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound { id: id.to_string() })
    }

    async fn invoke(&self, token: &str, args: &Value) -> ProviderResult<Value> {
        let handler = self
            .functions
            .get(token)
            .ok_or_else(|| ProviderError::UnknownFunction {
                token: token.to_string(),
            })?;
        handler(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const RG: &str = "azure-native:resources:ResourceGroup";

    fn props(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_create_autonames_and_echoes() {
        let provider = InMemoryProvider::new();
        let request = ResourceRequest::new(RG, "rg", props(json!({ "location": "westeurope" })));
        let response = provider.create(&request).await.unwrap();

        let name = response.outputs["name"].as_str().unwrap();
        assert!(name.starts_with("rg"));
        assert_eq!(name.len(), 9);
        assert_eq!(response.outputs["location"], json!("westeurope"));
        assert_eq!(response.id, format!("/resources/ResourceGroup/{name}"));
        assert_eq!(provider.resource_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_create_returns_same_instance() {
        let provider = InMemoryProvider::new();
        let request = ResourceRequest::new(RG, "rg", Map::new()).with_idempotency_key("rg-1");

        let first = provider.create(&request).await.unwrap();
        let again = provider.create(&request).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(provider.ids_named("rg").len(), 1);

        let other = ResourceRequest::new(RG, "rg", Map::new()).with_idempotency_key("rg-2");
        assert_ne!(provider.create(&other).await.unwrap().id, first.id);
        assert_eq!(provider.ids_named("rg").len(), 2);
    }

    #[tokio::test]
    async fn test_update_keeps_name_and_delete_removes() {
        let provider = InMemoryProvider::new();
        let request = ResourceRequest::new(RG, "rg", props(json!({ "name": "fixed" })));
        let created = provider.create(&request).await.unwrap();
        assert_eq!(created.id, "/resources/ResourceGroup/fixed");

        let update = ResourceRequest::new(RG, "rg", props(json!({ "tags": { "env": "dev" } })))
            .with_id(created.id.clone());
        let updated = provider.update(&update).await.unwrap();
        assert_eq!(updated.outputs["name"], json!("fixed"));
        assert_eq!(updated.outputs["tags"], json!({ "env": "dev" }));

        provider.delete(&update).await.unwrap();
        assert!(matches!(
            provider.delete(&update).await,
            Err(ProviderError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_functions_and_hooks() {
        let provider = InMemoryProvider::new()
            .with_function("azure-native:containerregistry:listRegistryCredentials", |_| {
                Ok(json!({ "username": "admin", "passwords": [{ "value": "pw" }] }))
            })
            .with_output_hook("azure-native:app:ContainerApp", |req, outputs| {
                outputs.insert(
                    String::from("configuration"),
                    json!({ "ingress": { "fqdn": format!("{}.azurecontainerapps.io", req.name) } }),
                );
            });

        let creds = provider
            .invoke("azure-native:containerregistry:listRegistryCredentials", &json!({}))
            .await
            .unwrap();
        assert_eq!(creds["username"], json!("admin"));
        assert!(matches!(
            provider.invoke("nope:fn", &json!({})).await,
            Err(ProviderError::UnknownFunction { .. })
        ));

        let app = provider
            .create(&ResourceRequest::new("azure-native:app:ContainerApp", "app", Map::new()))
            .await
            .unwrap();
        assert_eq!(
            app.outputs["configuration"]["ingress"]["fqdn"],
            json!("app.azurecontainerapps.io")
        );
    }
}
