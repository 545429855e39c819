//! Snapshot types.
//!
//! A snapshot records what the engine last observed for every resource it
//! manages: identity, the inputs it was created from and the outputs the
//! provider returned. Runs diff the desired graph against it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::ConfigHasher;
use crate::error::StateError;

/// Current version of the snapshot format.
pub const STATE_VERSION: &str = "1";

/// Maximum number of history entries kept.
const MAX_HISTORY: usize = 100;

/// The persisted state of one project environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Snapshot format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Incremented on every write.
    #[serde(default)]
    pub serial: u64,
    /// Managed resources, by logical name.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// Replaced instances whose deletion has not completed yet.
    #[serde(default)]
    pub pending_deletes: Vec<PendingDelete>,
    /// Stack outputs of the last run.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// When the snapshot was last written.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// Recorded state of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Logical name.
    pub name: String,
    /// Type token.
    #[serde(rename = "type")]
    pub type_token: String,
    /// Provider identity.
    pub id: String,
    /// Inputs the resource was last created or updated from.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Outputs returned by the provider, including `id`.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// Hash of `inputs`.
    #[serde(default)]
    pub inputs_hash: String,
    /// Resources this one depended on when last written.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Whether deletion is refused.
    #[serde(default)]
    pub protect: bool,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A replaced instance still waiting for deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDelete {
    /// Logical name of the resource it belonged to.
    pub name: String,
    /// Type token.
    #[serde(rename = "type")]
    pub type_token: String,
    /// Provider identity of the old instance.
    pub id: String,
    /// Outputs of the old instance.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// When the instance was superseded.
    pub since: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Resources that changed.
    pub resources: Vec<String>,
    /// Whether every node succeeded.
    pub success: bool,
    /// Optional error summary.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Apply of a desired graph.
    Apply,
    /// Teardown of every resource.
    Destroy,
}

impl StateSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            serial: 0,
            resources: BTreeMap::new(),
            pending_deletes: Vec::new(),
            outputs: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Checks that the snapshot can be used for a run of
    /// `project`/`environment`.
    ///
    /// # Errors
    ///
    /// Returns `VersionMismatch` or `ProjectMismatch`.
    pub fn check_compatible(&self, project: &str, environment: &str) -> Result<(), StateError> {
        if self.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            });
        }
        if self.project != project || self.environment != environment {
            return Err(StateError::ProjectMismatch {
                expected: format!("{project}/{environment}"),
                found: format!("{}/{}", self.project, self.environment),
            });
        }
        Ok(())
    }

    /// Gets a resource by name.
    #[must_use]
    pub fn get_resource(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    /// Adds or replaces a resource.
    pub fn set_resource(&mut self, resource: ResourceState) {
        self.resources.insert(resource.name.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource by name.
    pub fn remove_resource(&mut self, name: &str) -> Option<ResourceState> {
        let result = self.resources.remove(name);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Records a superseded instance for later deletion.
    pub fn add_pending_delete(&mut self, pending: PendingDelete) {
        if !self.pending_deletes.iter().any(|p| p.id == pending.id) {
            self.pending_deletes.push(pending);
            self.last_updated = Utc::now();
        }
    }

    /// Forgets a superseded instance once it is deleted.
    pub fn remove_pending_delete(&mut self, id: &str) -> Option<PendingDelete> {
        let position = self.pending_deletes.iter().position(|p| p.id == id)?;
        self.last_updated = Utc::now();
        Some(self.pending_deletes.remove(position))
    }

    /// Adds a history entry, keeping only the most recent ones.
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns all resource names.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    /// Recorded dependency edges, for building the prior graph.
    #[must_use]
    pub fn dependency_edges(&self) -> Vec<(String, BTreeSet<String>)> {
        self.resources
            .values()
            .map(|r| (r.name.clone(), r.dependencies.clone()))
            .collect()
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.pending_deletes.is_empty()
    }
}

impl ResourceState {
    /// Creates a resource record.
    ///
    /// `id` is also written into `outputs`.
    #[must_use]
    pub fn new(
        name: &str,
        type_token: &str,
        id: &str,
        inputs: Map<String, Value>,
        mut outputs: Map<String, Value>,
        dependencies: BTreeSet<String>,
    ) -> Self {
        let now = Utc::now();
        outputs.insert(String::from("id"), Value::String(id.to_string()));
        let inputs_hash = ConfigHasher::new().hash_properties(&inputs);
        Self {
            name: name.to_string(),
            type_token: type_token.to_string(),
            id: id.to_string(),
            inputs,
            outputs,
            inputs_hash,
            dependencies,
            protect: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the protect flag.
    #[must_use]
    pub const fn with_protect(mut self, protect: bool) -> Self {
        self.protect = protect;
        self
    }

    /// Keeps the creation time of an earlier record of the same instance.
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// The outputs as a single JSON object, as consumers see them.
    #[must_use]
    pub fn output_value(&self) -> Value {
        Value::Object(self.outputs.clone())
    }

    /// The record as a pending delete.
    #[must_use]
    pub fn to_pending_delete(&self) -> PendingDelete {
        PendingDelete {
            name: self.name.clone(),
            type_token: self.type_token.clone(),
            id: self.id.clone(),
            outputs: self.outputs.clone(),
            since: Utc::now(),
        }
    }
}

impl RunHistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(operation: RunOperation, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(operation: RunOperation, resources: Vec<String>, error: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(name: &str) -> ResourceState {
        let mut inputs = Map::new();
        inputs.insert(String::from("location"), json!("westeurope"));
        ResourceState::new(
            name,
            "azure-native:resources:ResourceGroup",
            &format!("/rg/{name}"),
            inputs,
            Map::new(),
            BTreeSet::new(),
        )
    }

    #[test]
    fn test_resource_outputs_carry_id() {
        let rg = resource("rg");
        assert_eq!(rg.outputs["id"], json!("/rg/rg"));
        assert_eq!(rg.inputs_hash.len(), 64);
        assert_eq!(rg.output_value()["id"], json!("/rg/rg"));
    }

    #[test]
    fn test_compatibility() {
        let mut snapshot = StateSnapshot::new("node-app", "dev");
        assert!(snapshot.check_compatible("node-app", "dev").is_ok());
        assert!(matches!(
            snapshot.check_compatible("node-app", "prod"),
            Err(StateError::ProjectMismatch { .. })
        ));

        snapshot.version = String::from("0");
        assert!(matches!(
            snapshot.check_compatible("node-app", "dev"),
            Err(StateError::VersionMismatch { .. })
        ));
    }

    #[test]
    fn test_pending_deletes_are_unique() {
        let mut snapshot = StateSnapshot::new("node-app", "dev");
        let old = resource("rg").to_pending_delete();
        snapshot.add_pending_delete(old.clone());
        snapshot.add_pending_delete(old);
        assert_eq!(snapshot.pending_deletes.len(), 1);
        assert!(snapshot.remove_pending_delete("/rg/rg").is_some());
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = StateSnapshot::new("node-app", "dev");
        for _ in 0..150 {
            snapshot.add_history(RunHistoryEntry::new(RunOperation::Apply, vec![]));
        }
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
    }

    #[test]
    fn test_json_shape() {
        let mut snapshot = StateSnapshot::new("node-app", "dev");
        snapshot.set_resource(resource("rg"));
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["version"], json!("1"));
        assert_eq!(value["resources"]["rg"]["type"], json!("azure-native:resources:ResourceGroup"));
        let back: StateSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(back, snapshot);
    }
}
