//! Per-type replacement rules.
//!
//! Which property changes force a replacement, and in which order a
//! replacement happens, are properties of the resource type. The registry
//! holds them so the planner does not need to know any provider.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::deployment::ResourceOptions;

/// Order in which a replacement's create and delete happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplacementPolicy {
    /// Delete the old instance, then create the new one. Needed when the
    /// type's identity (a globally unique name) cannot exist twice.
    DeleteBeforeCreate,
    /// Create the new instance first and delete the old one once every
    /// dependent has moved over.
    #[default]
    CreateBeforeDelete,
}

/// Replacement rules of one resource type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeSpec {
    /// Input keys whose change forces a replacement.
    #[serde(default)]
    pub replace_on_changes: Vec<String>,
    /// Replacement ordering for this type.
    #[serde(default)]
    pub replacement: ReplacementPolicy,
}

impl TypeSpec {
    /// Creates a spec with the given immutable keys.
    #[must_use]
    pub fn immutable<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replace_on_changes: keys.into_iter().map(Into::into).collect(),
            replacement: ReplacementPolicy::default(),
        }
    }

    /// Sets the replacement policy.
    #[must_use]
    pub const fn with_replacement(mut self, replacement: ReplacementPolicy) -> Self {
        self.replacement = replacement;
        self
    }
}

/// Replacement rules for every known resource type.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    specs: HashMap<String, TypeSpec>,
}

impl TypeRegistry {
    /// Creates an empty registry; every type then updates in place and
    /// replaces create-before-delete.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from the `types` section of a stack file.
    #[must_use]
    pub fn from_config(types: &BTreeMap<String, TypeSpec>) -> Self {
        Self {
            specs: types
                .iter()
                .map(|(token, spec)| (token.clone(), spec.clone()))
                .collect(),
        }
    }

    /// Registers a type, builder style.
    #[must_use]
    pub fn with_type(mut self, type_token: &str, spec: TypeSpec) -> Self {
        self.register(type_token, spec);
        self
    }

    /// Registers a type.
    pub fn register(&mut self, type_token: &str, spec: TypeSpec) {
        self.specs.insert(type_token.to_string(), spec);
    }

    /// Gets the rules of a type.
    #[must_use]
    pub fn spec(&self, type_token: &str) -> Option<&TypeSpec> {
        self.specs.get(type_token)
    }

    /// Returns true if changing `key` on a resource forces a replacement.
    #[must_use]
    pub fn is_immutable(&self, type_token: &str, key: &str, options: &ResourceOptions) -> bool {
        options.replace_on_changes.iter().any(|k| k == key)
            || self
                .spec(type_token)
                .is_some_and(|spec| spec.replace_on_changes.iter().any(|k| k == key))
    }

    /// Replacement ordering for a resource: the per-resource override wins
    /// over the type's policy.
    #[must_use]
    pub fn replacement_policy(
        &self,
        type_token: &str,
        options: &ResourceOptions,
    ) -> ReplacementPolicy {
        match options.delete_before_replace {
            Some(true) => ReplacementPolicy::DeleteBeforeCreate,
            Some(false) => ReplacementPolicy::CreateBeforeDelete,
            None => self
                .spec(type_token)
                .map(|spec| spec.replacement)
                .unwrap_or_default(),
        }
    }
}
