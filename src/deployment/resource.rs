//! Resource nodes and handles.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::output::{value_at_path, CellError, Output, Properties};

/// Per-resource options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOptions {
    /// Extra dependencies not expressed through inputs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Overrides the type's replacement ordering.
    #[serde(default)]
    pub delete_before_replace: Option<bool>,
    /// Refuse to delete or replace this resource.
    #[serde(default)]
    pub protect: bool,
    /// Input keys excluded from diffing.
    #[serde(default)]
    pub ignore_changes: Vec<String>,
    /// Extra input keys whose change forces a replacement.
    #[serde(default)]
    pub replace_on_changes: Vec<String>,
}

impl ResourceOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, handle: &ResourceHandle) -> Self {
        self.depends_on.push(handle.name().to_string());
        self
    }

    /// Protects the resource from deletion.
    #[must_use]
    pub const fn protect(mut self) -> Self {
        self.protect = true;
        self
    }

    /// Excludes an input key from diffing.
    #[must_use]
    pub fn ignore_changes(mut self, key: impl Into<String>) -> Self {
        self.ignore_changes.push(key.into());
        self
    }

    /// Forces a replacement when `key` changes.
    #[must_use]
    pub fn replace_on_changes(mut self, key: impl Into<String>) -> Self {
        self.replace_on_changes.push(key.into());
        self
    }

    /// Sets the replacement ordering for this resource.
    #[must_use]
    pub const fn delete_before_replace(mut self, value: bool) -> Self {
        self.delete_before_replace = Some(value);
        self
    }
}

/// A declared resource: what the user wants to exist.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    /// Type token, `package:module:Type`.
    pub type_token: String,
    /// Logical name, unique within a deployment.
    pub name: String,
    /// Input properties.
    pub inputs: Properties,
    /// Resource options.
    pub options: ResourceOptions,
}

impl ResourceNode {
    /// Creates a node with default options.
    #[must_use]
    pub fn new(type_token: &str, name: &str, inputs: Properties) -> Self {
        Self {
            type_token: type_token.to_string(),
            name: name.to_string(),
            inputs,
            options: ResourceOptions::default(),
        }
    }

    /// Sets the options.
    #[must_use]
    pub fn with_options(mut self, options: ResourceOptions) -> Self {
        self.options = options;
        self
    }

    /// Every resource this node waits on: the provenance of its inputs plus
    /// explicit `depends_on` entries.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut names = self.inputs.dependencies();
        names.extend(self.options.depends_on.iter().cloned());
        names
    }
}

/// A handle to a declared resource, used to wire its outputs into other
/// resources.
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    name: String,
    type_token: String,
    outputs: Output<Value>,
}

impl ResourceHandle {
    pub(crate) const fn new(name: String, type_token: String, outputs: Output<Value>) -> Self {
        Self {
            name,
            type_token,
            outputs,
        }
    }

    /// Logical name of the resource.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type token of the resource.
    #[must_use]
    pub fn type_token(&self) -> &str {
        &self.type_token
    }

    /// The resource's full output object.
    #[must_use]
    pub const fn outputs(&self) -> &Output<Value> {
        &self.outputs
    }

    /// A single output, by dotted path (`configuration.ingress.fqdn`).
    #[must_use]
    pub fn output(&self, path: &str) -> Output<Value> {
        path_output(&self.outputs, &self.name, path)
    }

    /// The provider identity, available once the resource exists.
    #[must_use]
    pub fn id(&self) -> Output<Value> {
        self.output("id")
    }
}

/// Derives the value at `path` from an output object.
pub(crate) fn path_output(outputs: &Output<Value>, owner: &str, path: &str) -> Output<Value> {
    let owner = owner.to_string();
    let path = path.to_string();
    outputs.try_map(move |value| {
        value_at_path(&value, &path)
            .cloned()
            .ok_or_else(|| {
                CellError::new(owner.clone(), format!("'{owner}' has no output '{path}'"))
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_handle_output_paths() {
        let handle = ResourceHandle::new(
            String::from("app"),
            String::from("azure-native:app:ContainerApp"),
            Output::known(json!({
                "id": "/app",
                "configuration": { "ingress": { "fqdn": "app.io" } }
            }))
            .with_dependency("app"),
        );

        let fqdn = handle.output("configuration.ingress.fqdn");
        assert!(fqdn.dependencies().contains("app"));
        assert_eq!(fqdn.resolve().await, Ok(json!("app.io")));
        assert_eq!(handle.id().resolve().await, Ok(json!("/app")));

        let err = handle.output("configuration.missing").resolve().await.unwrap_err();
        assert!(err.message.contains("no output 'configuration.missing'"));
    }

    #[test]
    fn test_node_dependencies_include_depends_on() {
        let (rg, _resolver) = Output::<Value>::pending("rg");
        let node = ResourceNode::new(
            "azure-native:authorization:RoleAssignment",
            "role",
            Properties::new().with("scope", rg),
        )
        .with_options(ResourceOptions {
            depends_on: vec![String::from("identity")],
            ..ResourceOptions::default()
        });

        let deps: Vec<_> = node.dependencies().into_iter().collect();
        assert_eq!(deps, vec!["identity", "rg"]);
    }
}
