//! Stack file parser.
//!
//! This module handles loading a stack from a YAML file and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, InfraError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::{StackConfig, StateBackend};

/// Parser for stack files.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new stack parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path used to find `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a stack from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading stack from: {}", path.display());

        if !path.exists() {
            return Err(InfraError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            InfraError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a stack from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing stack YAML");

        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map_or_else(
                || e.location().map(|l| format!("line {}, column {}", l.line(), l.column())),
                |p| Some(p.display().to_string()),
            );
            InfraError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed stack {} with {} resources",
            config.project.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads a stack and applies environment overrides.
    ///
    /// Environment variables are checked in the format
    /// `INFRAGRAPH_<SECTION>_<KEY>` (e.g., `INFRAGRAPH_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Applies environment variable overrides to a stack.
    pub fn apply_env_overrides(config: &mut StackConfig) {
        if let Ok(name) = std::env::var("INFRAGRAPH_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("INFRAGRAPH_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(bucket) = std::env::var("INFRAGRAPH_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment, switching to s3");
            config.state.backend = StateBackend::S3;
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("INFRAGRAPH_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                InfraError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default stack file names to search for.
pub const DEFAULT_STACK_FILES: &[&str] = &[
    "infragraph.stack.yaml",
    "infragraph.stack.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the stack file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no stack file is found.
pub fn find_stack_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_STACK_FILES {
            let candidate = current.join(filename);
            if candidate.exists() {
                info!("Found stack file: {}", candidate.display());
                return Ok(candidate);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(InfraError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_STACK_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ReplacementPolicy;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_stack() {
        let yaml = r"
project:
  name: node-app
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "node-app");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_stack() {
        let yaml = r#"
project:
  name: node-app
  environment: prod
state:
  backend: s3
  bucket: infra-state
engine:
  parallelism: 4
types:
  "azure-native:storage:StorageAccount":
    replace_on_changes: [kind]
    replacement: delete-before-create
variables:
  - name: creds
    invoke: "azure-native:containerregistry:listRegistryCredentials"
    arguments:
      registryName: "${registry.name}"
    secret: true
resources:
  - name: rg
    type: "azure-native:resources:ResourceGroup"
  - name: registry
    type: "azure-native:containerregistry:Registry"
    properties:
      resourceGroupName: "${rg.name}"
      sku: { name: Basic }
      adminUserEnabled: true
    options:
      protect: true
      ignore_changes: [tags]
outputs:
  url: "https://${registry.loginServer}"
"#;
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.engine.parallelism, 4);
        assert_eq!(config.engine.max_attempts, 5);
        assert_eq!(
            config.types["azure-native:storage:StorageAccount"].replacement,
            ReplacementPolicy::DeleteBeforeCreate
        );
        assert!(config.variables[0].secret);
        assert_eq!(config.resource_names(), vec!["rg", "registry"]);

        let registry = config.resource("registry").unwrap();
        assert!(registry.options.protect);
        assert_eq!(registry.properties["sku"], json!({ "name": "Basic" }));
        assert_eq!(config.outputs["url"], json!("https://${registry.loginServer}"));
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = ConfigParser::new()
            .parse_yaml("project: [unclosed", None)
            .unwrap_err();
        assert!(matches!(
            err,
            InfraError::Config(ConfigError::ParseError { location: Some(_), .. })
        ));
    }

    #[test]
    fn test_find_stack_file_walks_up() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("infragraph.stack.yaml"), "project: { name: x }").unwrap();

        let found = find_stack_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("infragraph.stack.yaml"));
    }

    #[test]
    fn test_load_file_missing() {
        let err = ConfigParser::new().load_file("/nonexistent/stack.yaml").unwrap_err();
        assert!(matches!(err, InfraError::Config(ConfigError::FileNotFound { .. })));
    }
}
