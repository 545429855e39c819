//! Building a deployment from a stack file.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{parse_template, Reference, Segment, StackConfig};
use crate::error::{ConfigError, Result};
use crate::output::{Input, Output, Properties};
use crate::provider::ProviderInvoker;

use super::context::Deployment;
use super::resource::path_output;

/// Resolves reference roots while a stack is being loaded.
struct Scope<'a> {
    resources: HashSet<&'a str>,
    variables: HashMap<String, Output<Value>>,
}

impl Deployment {
    /// Builds a deployment from a parsed stack.
    ///
    /// Variables are declared first, in file order; each may reference
    /// resources and earlier variables. A string that is a single reference
    /// keeps the referenced JSON value; references embedded in text are
    /// rendered into the string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidReference` for malformed or dangling references and
    /// `DuplicateResource` for repeated names.
    pub fn from_config(config: &StackConfig, invoker: Arc<ProviderInvoker>) -> Result<Self> {
        let mut deployment = Self::new(&config.project.name, &config.project.environment, invoker);
        let mut scope = Scope {
            resources: config.resources.iter().map(|r| r.name.as_str()).collect(),
            variables: HashMap::new(),
        };

        for variable in &config.variables {
            let args = interpolate_map(&variable.arguments, &scope, &mut deployment)?;
            let mut output = deployment.invoke(&variable.invoke, args);
            if variable.secret {
                output = output.as_secret();
            }
            debug!("Declared variable {} = {}", variable.name, variable.invoke);
            scope.variables.insert(variable.name.clone(), output);
        }

        for resource in &config.resources {
            let inputs = interpolate_map(&resource.properties, &scope, &mut deployment)?;
            deployment.resource_with(
                &resource.type_token,
                &resource.name,
                inputs,
                resource.effective_options(),
            )?;
        }

        for (name, value) in &config.outputs {
            let output = interpolate(value, &scope, &mut deployment)?.into_output();
            deployment.export(name, output);
        }

        info!(
            "Loaded deployment {}/{} with {} resources",
            deployment.project(),
            deployment.environment(),
            deployment.len()
        );
        Ok(deployment)
    }
}

fn interpolate_map(
    values: &BTreeMap<String, Value>,
    scope: &Scope<'_>,
    deployment: &mut Deployment,
) -> Result<Properties> {
    values
        .iter()
        .map(|(key, value)| Ok((key.clone(), interpolate(value, scope, deployment)?)))
        .collect()
}

fn interpolate(value: &Value, scope: &Scope<'_>, deployment: &mut Deployment) -> Result<Input> {
    match value {
        Value::String(text) => interpolate_string(text, scope, deployment),
        Value::Array(items) => Ok(Input::List(
            items
                .iter()
                .map(|item| interpolate(item, scope, deployment))
                .collect::<Result<_>>()?,
        )),
        Value::Object(map) => Ok(Input::Object(
            map.iter()
                .map(|(key, item)| Ok((key.clone(), interpolate(item, scope, deployment)?)))
                .collect::<Result<_>>()?,
        )),
        other => Ok(Input::Value(other.clone())),
    }
}

fn interpolate_string(text: &str, scope: &Scope<'_>, deployment: &mut Deployment) -> Result<Input> {
    let segments = parse_template(text)?;

    match segments.as_slice() {
        [] => Ok(Input::Value(Value::String(String::new()))),
        [Segment::Literal(literal)] => Ok(Input::Value(Value::String(literal.clone()))),
        [Segment::Reference(reference)] => {
            Ok(Input::Output(resolve(reference, scope, deployment)?))
        }
        _ => {
            let mut parts = Vec::with_capacity(segments.len());
            for segment in &segments {
                parts.push(match segment {
                    Segment::Literal(literal) => Output::known(Value::String(literal.clone())),
                    Segment::Reference(reference) => resolve(reference, scope, deployment)?,
                });
            }
            Ok(Input::Output(Output::all(parts).map(|values| {
                Value::String(values.iter().map(render).collect())
            })))
        }
    }
}

fn resolve(
    reference: &Reference,
    scope: &Scope<'_>,
    deployment: &mut Deployment,
) -> Result<Output<Value>> {
    if let Some(variable) = scope.variables.get(&reference.root) {
        return Ok(path_output(variable, &reference.root, &reference.path));
    }
    if scope.resources.contains(reference.root.as_str()) {
        let outputs = deployment.reference(&reference.root);
        return Ok(path_output(&outputs, &reference.root, &reference.path));
    }
    Err(ConfigError::InvalidReference {
        reference: reference.to_template(),
        reason: String::from("names no resource or earlier variable"),
    }
    .into())
}

/// Renders a value for embedding into a string.
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
