//! Stack file specification types.
//!
//! This module defines the structs that map to the `infragraph.stack.yaml`
//! file. A stack file declares the desired resource graph: resources, the
//! provider functions feeding them, and the values exported at the end.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::deployment::ResourceOptions;
use crate::provider::TypeSpec;

/// The root structure of a stack file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Replacement rules per resource type.
    #[serde(default)]
    pub types: BTreeMap<String, TypeSpec>,
    /// Provider function calls whose results resources can reference.
    #[serde(default)]
    pub variables: Vec<VariableConfig>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Stack outputs, by name.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Engine tuning: concurrency and retry behaviour.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of provider operations in flight.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any retry delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Keep launching independent operations after a failure.
    #[serde(default = "default_continue_on_error")]
    pub continue_on_error: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            continue_on_error: default_continue_on_error(),
        }
    }
}

/// A provider function call bound to a name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariableConfig {
    /// Name other entries reference it by.
    pub name: String,
    /// Function token, `package:module:function`.
    pub invoke: String,
    /// Function arguments; may contain references.
    #[serde(default)]
    pub arguments: BTreeMap<String, Value>,
    /// Whether the result must be treated as secret.
    #[serde(default)]
    pub secret: bool,
}

/// A declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Logical name, unique within the stack.
    pub name: String,
    /// Type token, `package:module:Type`.
    #[serde(rename = "type")]
    pub type_token: String,
    /// Input properties; may contain references.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Shorthand for `options.depends_on`.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Resource options.
    #[serde(default)]
    pub options: ResourceOptions,
}

const fn default_parallelism() -> usize {
    8
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_delay_ms() -> u64 {
    250
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_continue_on_error() -> bool {
    true
}

fn default_environment() -> String {
    String::from("dev")
}

impl StackConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns resource names in declaration order.
    #[must_use]
    pub fn resource_names(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.name.as_str()).collect()
    }

    /// Finds a resource by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }
}

impl ResourceConfig {
    /// Options with the `depends_on` shorthand merged in.
    #[must_use]
    pub fn effective_options(&self) -> ResourceOptions {
        let mut options = self.options.clone();
        for dep in &self.depends_on {
            if !options.depends_on.contains(dep) {
                options.depends_on.push(dep.clone());
            }
        }
        options
    }
}
