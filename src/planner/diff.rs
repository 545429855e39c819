//! Diff engine for comparing desired inputs with the recorded snapshot.
//!
//! Inputs that cannot be resolved yet (their producers have pending
//! changes) are compared as unknown and always count as a change.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::ConfigHasher;
use crate::deployment::ResourceOptions;
use crate::provider::TypeRegistry;
use crate::state::ResourceState;

/// Engine for classifying resources against the snapshot.
#[derive(Debug, Clone, Copy)]
pub struct DiffEngine<'a> {
    /// Replacement rules per type.
    types: &'a TypeRegistry,
    /// Input hasher.
    hasher: ConfigHasher,
}

/// What a run does with a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Recorded inputs match the desired inputs.
    Unchanged,
    /// The resource is not recorded.
    Create,
    /// The resource is updated in place.
    Update,
    /// A new instance replaces the recorded one.
    Replace,
    /// The resource is no longer declared.
    Delete,
}

/// How a single property differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyChange {
    /// Present now, absent before.
    Added,
    /// Absent now, present before.
    Removed,
    /// Both present, values differ.
    Changed,
    /// Not known until a dependency is applied.
    Unknown,
}

/// Difference for a single property.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PropertyDiff {
    /// Property name.
    pub key: String,
    /// Kind of difference.
    pub change: PropertyChange,
    /// Whether this difference forces a replacement.
    pub forces_replacement: bool,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    /// Classification.
    pub kind: ChangeKind,
    /// Property-level details, empty for `Create` and `Unchanged`.
    pub details: Vec<PropertyDiff>,
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine using the replacement rules of `types`.
    #[must_use]
    pub const fn new(types: &'a TypeRegistry) -> Self {
        Self {
            types,
            hasher: ConfigHasher::new(),
        }
    }

    /// Classifies a desired resource against its recorded state.
    ///
    /// `inputs` maps each property to its value, or `None` if unknown.
    /// Keys listed in `ignore_changes` are not compared.
    #[must_use]
    pub fn diff(
        &self,
        type_token: &str,
        options: &ResourceOptions,
        prior: Option<&ResourceState>,
        inputs: &BTreeMap<String, Option<Value>>,
    ) -> ResourceDiff {
        let Some(prior) = prior else {
            return ResourceDiff {
                kind: ChangeKind::Create,
                details: Vec::new(),
            };
        };

        if prior.type_token != type_token {
            debug!(
                "Type of {} changed from {} to {type_token}",
                prior.name, prior.type_token
            );
            return ResourceDiff {
                kind: ChangeKind::Replace,
                details: vec![PropertyDiff {
                    key: String::from("type"),
                    change: PropertyChange::Changed,
                    forces_replacement: true,
                }],
            };
        }

        if let Some(known) = known_inputs(inputs) {
            let effective = effective_inputs(Some(prior), known, &options.ignore_changes);
            let hash = self.hasher.hash_properties(&effective);
            if ConfigHasher::hashes_match(&hash, &prior.inputs_hash) {
                return ResourceDiff {
                    kind: ChangeKind::Unchanged,
                    details: Vec::new(),
                };
            }
        }

        let details = self.property_diffs(type_token, options, &prior.inputs, inputs);
        let kind = if details.is_empty() {
            ChangeKind::Unchanged
        } else if details.iter().any(|d| d.forces_replacement) {
            ChangeKind::Replace
        } else {
            ChangeKind::Update
        };

        debug!("{} classified as {kind} ({} keys differ)", prior.name, details.len());
        ResourceDiff { kind, details }
    }

    /// Compares properties key by key.
    fn property_diffs(
        &self,
        type_token: &str,
        options: &ResourceOptions,
        old: &Map<String, Value>,
        new: &BTreeMap<String, Option<Value>>,
    ) -> Vec<PropertyDiff> {
        let ignored = |key: &str| options.ignore_changes.iter().any(|k| k == key);
        let mut details = Vec::new();

        for (key, value) in new {
            if ignored(key) {
                continue;
            }
            let change = match (old.get(key), value) {
                (_, None) => Some(PropertyChange::Unknown),
                (None, Some(_)) => Some(PropertyChange::Added),
                (Some(before), Some(after)) if before != after => Some(PropertyChange::Changed),
                _ => None,
            };
            if let Some(change) = change {
                details.push(PropertyDiff {
                    key: key.clone(),
                    change,
                    forces_replacement: self.types.is_immutable(type_token, key, options),
                });
            }
        }

        for key in old.keys() {
            if !new.contains_key(key) && !ignored(key) {
                details.push(PropertyDiff {
                    key: key.clone(),
                    change: PropertyChange::Removed,
                    forces_replacement: self.types.is_immutable(type_token, key, options),
                });
            }
        }

        details
    }
}

/// Returns the inputs as a plain object if every value is known.
#[must_use]
pub fn known_inputs(inputs: &BTreeMap<String, Option<Value>>) -> Option<Map<String, Value>> {
    inputs
        .iter()
        .map(|(key, value)| value.clone().map(|v| (key.clone(), v)))
        .collect()
}

/// The inputs sent to the provider: ignored keys keep their recorded value,
/// or are left out if nothing was recorded for them.
#[must_use]
pub fn effective_inputs(
    prior: Option<&ResourceState>,
    mut inputs: Map<String, Value>,
    ignore_changes: &[String],
) -> Map<String, Value> {
    let Some(prior) = prior else {
        return inputs;
    };
    for key in ignore_changes {
        match prior.inputs.get(key) {
            Some(value) => {
                inputs.insert(key.clone(), value.clone());
            }
            None => {
                inputs.remove(key);
            }
        }
    }
    inputs
}

impl ChangeKind {
    /// Returns true if the resource needs a provider operation.
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unchanged => "unchanged",
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PropertyDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let marker = match self.change {
            PropertyChange::Added => "+",
            PropertyChange::Removed => "-",
            PropertyChange::Changed => "~",
            PropertyChange::Unknown => "?",
        };
        write!(f, "{marker}{}", self.key)?;
        if self.forces_replacement {
            write!(f, " (forces replacement)")?;
        }
        Ok(())
    }
}
