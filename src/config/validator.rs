//! Stack validation.
//!
//! This module checks a parsed stack for problems that would otherwise only
//! surface in the middle of a run: bad names and type tokens, duplicate
//! entries, dangling references and out-of-range engine settings.

use crate::error::{ConfigError, InfraError, Result};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    EngineConfig, ProjectConfig, ResourceConfig, StackConfig, StateBackend, StateConfig,
};
use super::template::value_references;

/// Parallelism above which a warning is emitted.
const PARALLELISM_WARN_THRESHOLD: usize = 64;

/// Validator for stacks.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack.
    ///
    /// # Errors
    ///
    /// Returns the first error found; the full list is in the result.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Stack validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(InfraError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &StackConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_engine(&config.engine, &mut result);
        Self::validate_types(config, &mut result);
        Self::validate_entries(config, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored for the local backend"));
                }
            }
        }
    }

    fn validate_engine(engine: &EngineConfig, result: &mut ValidationResult) {
        if engine.parallelism == 0 {
            result.error("engine.parallelism", "Parallelism must be at least 1");
        } else if engine.parallelism > PARALLELISM_WARN_THRESHOLD {
            result.warnings.push(format!(
                "engine.parallelism {} is high; providers may rate limit",
                engine.parallelism
            ));
        }

        if engine.max_attempts == 0 {
            result.error("engine.max_attempts", "At least one attempt is required");
        }

        if engine.base_delay_ms > engine.max_delay_ms {
            result.error(
                "engine.base_delay_ms",
                format!(
                    "Base delay {}ms exceeds max delay {}ms",
                    engine.base_delay_ms, engine.max_delay_ms
                ),
            );
        }
    }

    fn validate_types(config: &StackConfig, result: &mut ValidationResult) {
        for token in config.types.keys() {
            if !is_valid_token(token) {
                result.error(
                    format!("types.{token}"),
                    format!("Type token '{token}' must have the form package:module:Type"),
                );
            }
        }
    }

    fn validate_entries(config: &StackConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in stack"));
        }

        let resource_names: HashSet<&str> =
            config.resources.iter().map(|r| r.name.as_str()).collect();
        let mut seen = HashSet::new();
        let mut variables_so_far = HashSet::new();

        for (i, variable) in config.variables.iter().enumerate() {
            let field = format!("variables[{i}]");
            if !is_valid_logical_name(&variable.name) {
                result.error(
                    format!("{field}.name"),
                    format!("Variable name '{}' is invalid", variable.name),
                );
            }
            let name = variable.name.as_str();
            if !seen.insert(name) || resource_names.contains(name) {
                result.error(
                    format!("{field}.name"),
                    format!("Name '{}' is declared more than once", variable.name),
                );
            }
            if !is_valid_token(&variable.invoke) {
                result.error(
                    format!("{field}.invoke"),
                    format!(
                        "Function token '{}' must have the form package:module:function",
                        variable.invoke
                    ),
                );
            }
            for value in variable.arguments.values() {
                Self::validate_references(
                    value,
                    &field,
                    &resource_names,
                    &variables_so_far,
                    result,
                );
            }
            variables_so_far.insert(variable.name.as_str());
        }

        for (i, resource) in config.resources.iter().enumerate() {
            let field = format!("resources[{i}]");
            Self::validate_resource(resource, &field, &resource_names, result);
            if !seen.insert(resource.name.as_str()) {
                result.error(
                    format!("{field}.name"),
                    format!("Name '{}' is declared more than once", resource.name),
                );
            }
            for value in resource.properties.values() {
                Self::validate_references(
                    value,
                    &field,
                    &resource_names,
                    &variables_so_far,
                    result,
                );
            }
        }

        for (name, value) in &config.outputs {
            Self::validate_references(
                value,
                &format!("outputs.{name}"),
                &resource_names,
                &variables_so_far,
                result,
            );
        }
    }

    fn validate_resource(
        resource: &ResourceConfig,
        field: &str,
        resource_names: &HashSet<&str>,
        result: &mut ValidationResult,
    ) {
        if !is_valid_logical_name(&resource.name) {
            result.error(
                format!("{field}.name"),
                format!(
                    "Resource name '{}' is invalid. Must start with a letter and contain \
                     only letters, digits, '-' or '_'.",
                    resource.name
                ),
            );
        }

        if !is_valid_token(&resource.type_token) {
            result.error(
                format!("{field}.type"),
                format!(
                    "Type token '{}' must have the form package:module:Type",
                    resource.type_token
                ),
            );
        }

        for dep in &resource.effective_options().depends_on {
            if dep == &resource.name {
                result.error(
                    format!("{field}.depends_on"),
                    format!("Resource '{}' cannot depend on itself", resource.name),
                );
            } else if !resource_names.contains(dep.as_str()) {
                result.error(
                    format!("{field}.depends_on"),
                    format!("Resource '{}' depends on unknown resource '{dep}'", resource.name),
                );
            }
        }

        for key in &resource.options.ignore_changes {
            if !resource.properties.contains_key(key) {
                result.warnings.push(format!(
                    "{field}: ignore_changes key '{key}' is not a declared property"
                ));
            }
        }
    }

    fn validate_references(
        value: &serde_json::Value,
        field: &str,
        resource_names: &HashSet<&str>,
        variables: &HashSet<&str>,
        result: &mut ValidationResult,
    ) {
        match value_references(value) {
            Ok(references) => {
                for reference in references {
                    let root = reference.root.as_str();
                    if !resource_names.contains(root) && !variables.contains(root) {
                        result.error(
                            field,
                            format!(
                                "Reference {} names no resource or earlier variable",
                                reference.to_template()
                            ),
                        );
                    }
                }
            }
            Err(e) => result.error(field, e.to_string()),
        }
    }
}

/// Validates a project name (lowercase alphanumeric with hyphens).
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let mut chars = name.chars();

    // First character must be a letter
    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase()
    {
        return false;
    }

    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return false;
        }
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Validates a logical resource or variable name.
fn is_valid_logical_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validates a `package:module:Type` token.
fn is_valid_token(token: &str) -> bool {
    let parts: Vec<_> = token.split(':').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && !p.contains(char::is_whitespace))
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
