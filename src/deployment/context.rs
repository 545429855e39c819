//! The deployment context.
//!
//! Every resource, function call and export is declared through a
//! [`Deployment`] value. Each logical name owns one output slot, created the
//! first time the name is declared or referenced, so resources can be wired
//! to others that are declared later.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::output::{CellError, Output, OutputResolver, Properties};
use crate::provider::ProviderInvoker;

use super::resource::{ResourceHandle, ResourceNode, ResourceOptions};

struct Slot {
    outputs: Output<Value>,
    resolver: Option<OutputResolver<Value>>,
}

/// A declared deployment: the desired resource graph of one project
/// environment.
pub struct Deployment {
    project: String,
    environment: String,
    invoker: Arc<ProviderInvoker>,
    nodes: Vec<ResourceNode>,
    slots: HashMap<String, Slot>,
    exports: BTreeMap<String, Output<Value>>,
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("project", &self.project)
            .field("environment", &self.environment)
            .field("resources", &self.nodes.len())
            .field("exports", &self.exports.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// The pieces of a deployment, taken apart for a run.
pub(crate) struct DeploymentParts {
    pub project: String,
    pub environment: String,
    pub nodes: Vec<ResourceNode>,
    pub exports: BTreeMap<String, Output<Value>>,
    pub resolvers: HashMap<String, OutputResolver<Value>>,
}

impl Deployment {
    /// Creates an empty deployment. Function calls go through `invoker`.
    #[must_use]
    pub fn new(project: &str, environment: &str, invoker: Arc<ProviderInvoker>) -> Self {
        Self {
            project: project.to_string(),
            environment: environment.to_string(),
            invoker,
            nodes: Vec::new(),
            slots: HashMap::new(),
            exports: BTreeMap::new(),
        }
    }

    /// Project name.
    #[must_use]
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Environment name.
    #[must_use]
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Declared resources, in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Finds a declared resource.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&ResourceNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Declared exports.
    #[must_use]
    pub const fn exports(&self) -> &BTreeMap<String, Output<Value>> {
        &self.exports
    }

    /// Number of declared resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no resource is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Declares a resource with default options.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResource` if the name is already declared.
    pub fn resource(
        &mut self,
        type_token: &str,
        name: &str,
        inputs: Properties,
    ) -> Result<ResourceHandle> {
        self.resource_with(type_token, name, inputs, ResourceOptions::default())
    }

    /// Declares a resource.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateResource` if the name is already declared.
    pub fn resource_with(
        &mut self,
        type_token: &str,
        name: &str,
        inputs: Properties,
        options: ResourceOptions,
    ) -> Result<ResourceHandle> {
        if self.node(name).is_some() {
            return Err(GraphError::DuplicateResource {
                name: name.to_string(),
            }
            .into());
        }

        debug!("Declared {type_token} {name}");
        let outputs = self.slot(name).outputs.clone();
        self.nodes
            .push(ResourceNode::new(type_token, name, inputs).with_options(options));
        Ok(ResourceHandle::new(
            name.to_string(),
            type_token.to_string(),
            outputs,
        ))
    }

    /// The outputs of a resource that may be declared later.
    pub fn reference(&mut self, name: &str) -> Output<Value> {
        self.slot(name).outputs.clone()
    }

    /// Calls a provider function.
    ///
    /// The call runs lazily, once its arguments resolve and something awaits
    /// the result. Its provenance is the arguments' provenance.
    #[must_use]
    pub fn invoke(&self, token: &str, args: Properties) -> Output<Value> {
        let invoker = Arc::clone(&self.invoker);
        let token = token.to_string();
        let dependencies = args.dependencies();
        let secret = args.is_secret();

        Output::from_future(
            async move {
                let resolved = args.resolve().await?;
                invoker
                    .invoke(&token, &Value::Object(resolved))
                    .await
                    .map_err(|e| CellError::new(token.clone(), e.to_string()))
            },
            dependencies,
            secret,
        )
    }

    /// Exports a named stack output.
    pub fn export(&mut self, name: &str, output: Output<Value>) {
        self.exports.insert(name.to_string(), output);
    }

    /// The invoker used for function calls.
    #[must_use]
    pub fn invoker(&self) -> &Arc<ProviderInvoker> {
        &self.invoker
    }

    fn slot(&mut self, name: &str) -> &mut Slot {
        self.slots.entry(name.to_string()).or_insert_with(|| {
            let (outputs, resolver) = Output::pending(name);
            Slot {
                outputs,
                resolver: Some(resolver),
            }
        })
    }

    pub(crate) fn into_parts(self) -> DeploymentParts {
        let resolvers = self
            .slots
            .into_iter()
            .filter_map(|(name, slot)| slot.resolver.map(|r| (name, r)))
            .collect();
        DeploymentParts {
            project: self.project,
            environment: self.environment,
            nodes: self.nodes,
            exports: self.exports,
            resolvers,
        }
    }
}
