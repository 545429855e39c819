//! Resource input property trees.
//!
//! Inputs mix literal JSON with deferred [`Output`] leaves. The provenance of
//! every leaf is available statically through [`Input::dependencies`], which is
//! what the dependency graph is built from.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use futures::future::{self, BoxFuture, FutureExt};
use serde_json::{Map, Value};

use super::cell::{CellResult, Output};

/// A single resource input: a literal, a deferred value, or a tree of them.
#[derive(Debug, Clone)]
pub enum Input {
    /// A literal JSON value.
    Value(Value),
    /// A value produced by another resource or function.
    Output(Output<Value>),
    /// A list of inputs.
    List(Vec<Input>),
    /// A map of inputs.
    Object(BTreeMap<String, Input>),
}

impl Input {
    /// Collects the provenance of every deferred leaf.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_dependencies(&mut names);
        names
    }

    fn collect_dependencies(&self, names: &mut BTreeSet<String>) {
        match self {
            Self::Value(_) => {}
            Self::Output(output) => names.extend(output.dependencies().iter().cloned()),
            Self::List(items) => {
                for item in items {
                    item.collect_dependencies(names);
                }
            }
            Self::Object(map) => {
                for item in map.values() {
                    item.collect_dependencies(names);
                }
            }
        }
    }

    /// Returns true if any leaf is secret.
    #[must_use]
    pub fn is_secret(&self) -> bool {
        match self {
            Self::Value(_) => false,
            Self::Output(output) => output.is_secret(),
            Self::List(items) => items.iter().any(Self::is_secret),
            Self::Object(map) => map.values().any(Self::is_secret),
        }
    }

    /// Waits for every leaf and returns the plain JSON value.
    pub fn resolve(&self) -> BoxFuture<'_, CellResult<Value>> {
        async move {
            match self {
                Self::Value(value) => Ok(value.clone()),
                Self::Output(output) => output.resolve().await,
                Self::List(items) => {
                    let values = future::try_join_all(items.iter().map(Self::resolve)).await?;
                    Ok(Value::Array(values))
                }
                Self::Object(map) => {
                    let mut object = Map::new();
                    for (key, item) in map {
                        object.insert(key.clone(), item.resolve().await?);
                    }
                    Ok(Value::Object(object))
                }
            }
        }
        .boxed()
    }

    /// Resolves the input only if every leaf's producers are in `settled`.
    ///
    /// Returns `Ok(None)` when some leaf is still unknown.
    pub fn resolve_settled<'a>(
        &'a self,
        settled: &'a HashSet<String>,
    ) -> BoxFuture<'a, CellResult<Option<Value>>> {
        async move {
            match self {
                Self::Value(value) => Ok(Some(value.clone())),
                Self::Output(output) => {
                    if output.dependencies().iter().all(|d| settled.contains(d)) {
                        output.resolve().await.map(Some)
                    } else {
                        Ok(None)
                    }
                }
                Self::List(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        match item.resolve_settled(settled).await? {
                            Some(value) => values.push(value),
                            None => return Ok(None),
                        }
                    }
                    Ok(Some(Value::Array(values)))
                }
                Self::Object(map) => {
                    let mut object = Map::new();
                    for (key, item) in map {
                        match item.resolve_settled(settled).await? {
                            Some(value) => {
                                object.insert(key.clone(), value);
                            }
                            None => return Ok(None),
                        }
                    }
                    Ok(Some(Value::Object(object)))
                }
            }
        }
        .boxed()
    }

    /// Turns the input into a single cell.
    #[must_use]
    pub fn into_output(self) -> Output<Value> {
        match self {
            Self::Value(value) => Output::known(value),
            Self::Output(output) => output,
            tree => {
                let dependencies = tree.dependencies();
                let secret = tree.is_secret();
                Output::from_future(async move { tree.resolve().await }, dependencies, secret)
            }
        }
    }
}

impl From<Value> for Input {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<Output<Value>> for Input {
    fn from(output: Output<Value>) -> Self {
        Self::Output(output)
    }
}

impl From<&str> for Input {
    fn from(value: &str) -> Self {
        Self::Value(Value::String(value.to_string()))
    }
}

impl From<String> for Input {
    fn from(value: String) -> Self {
        Self::Value(Value::String(value))
    }
}

impl From<i64> for Input {
    fn from(value: i64) -> Self {
        Self::Value(Value::from(value))
    }
}

impl From<bool> for Input {
    fn from(value: bool) -> Self {
        Self::Value(Value::Bool(value))
    }
}

impl From<Vec<Self>> for Input {
    fn from(items: Vec<Self>) -> Self {
        Self::List(items)
    }
}

impl From<Properties> for Input {
    fn from(properties: Properties) -> Self {
        Self::Object(properties.0)
    }
}

/// Ordered map of input properties, with a builder API.
#[derive(Debug, Clone, Default)]
pub struct Properties(BTreeMap<String, Input>);

impl Properties {
    /// Creates an empty property map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a property, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Input>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Inserts or replaces a property.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Input>) {
        self.0.insert(key.into(), value.into());
    }

    /// Gets a property by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Input> {
        self.0.get(key)
    }

    /// Iterates over the properties in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Input)> {
        self.0.iter()
    }

    /// Number of properties.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no properties.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Union of the provenance of all properties.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for input in self.0.values() {
            input.collect_dependencies(&mut names);
        }
        names
    }

    /// Returns true if any property is secret.
    #[must_use]
    pub fn is_secret(&self) -> bool {
        self.0.values().any(Input::is_secret)
    }

    /// Keys whose value is secret.
    #[must_use]
    pub fn secret_keys(&self) -> BTreeSet<String> {
        self.0
            .iter()
            .filter(|(_, input)| input.is_secret())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Waits for every property.
    ///
    /// # Errors
    ///
    /// Returns the first failure among the deferred leaves.
    pub async fn resolve(&self) -> CellResult<Map<String, Value>> {
        let mut object = Map::new();
        for (key, input) in &self.0 {
            object.insert(key.clone(), input.resolve().await?);
        }
        Ok(object)
    }

    /// Resolves what can be resolved from settled producers.
    ///
    /// Keys mapped to `None` are unknown until their producers run.
    ///
    /// # Errors
    ///
    /// Returns the failure of a settled leaf.
    pub async fn resolve_settled(
        &self,
        settled: &HashSet<String>,
    ) -> CellResult<BTreeMap<String, Option<Value>>> {
        let mut values = BTreeMap::new();
        for (key, input) in &self.0 {
            values.insert(key.clone(), input.resolve_settled(settled).await?);
        }
        Ok(values)
    }
}

impl FromIterator<(String, Input)> for Properties {
    fn from_iter<I: IntoIterator<Item = (String, Input)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Looks up a dotted path (`configuration.ingress.fqdn`, `items.0.name`).
///
/// An empty path returns the value itself.
#[must_use]
pub fn value_at_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_dependencies_walk_nested() {
        let (rg, rg_resolver) = Output::<Value>::pending("rg");
        let (ws, ws_resolver) = Output::<Value>::pending("workspace");
        let props = Properties::new()
            .with("resourceGroupName", rg.clone())
            .with("location", "westeurope")
            .with(
                "appLogsConfiguration",
                Properties::new().with("customerId", ws.clone()),
            );

        let deps: Vec<_> = props.dependencies().into_iter().collect();
        assert_eq!(deps, vec!["rg", "workspace"]);

        rg_resolver.resolve(json!("rg-123"));
        ws_resolver.resolve(json!("cust-1"));
        let resolved = props.resolve().await.unwrap();
        assert_eq!(
            Value::Object(resolved),
            json!({
                "appLogsConfiguration": { "customerId": "cust-1" },
                "location": "westeurope",
                "resourceGroupName": "rg-123"
            })
        );
    }

    #[tokio::test]
    async fn test_resolve_settled_marks_unknowns() {
        let (rg, rg_resolver) = Output::<Value>::pending("rg");
        let (reg, _reg_resolver) = Output::<Value>::pending("registry");
        let props = Properties::new()
            .with("group", rg)
            .with("servers", vec![Input::from(reg)])
            .with("port", 80_i64);

        rg_resolver.resolve(json!("rg-1"));
        let settled = HashSet::from([String::from("rg")]);
        let values = props.resolve_settled(&settled).await.unwrap();
        assert_eq!(values["group"], Some(json!("rg-1")));
        assert_eq!(values["servers"], None);
        assert_eq!(values["port"], Some(json!(80)));
    }

    #[test]
    fn test_secret_keys() {
        let props = Properties::new()
            .with("password", Output::known(json!("pw")).as_secret())
            .with("username", "admin");
        assert!(props.is_secret());
        assert_eq!(props.secret_keys().into_iter().collect::<Vec<_>>(), vec!["password"]);
    }

    #[test]
    fn test_value_at_path() {
        let value = json!({
            "configuration": { "ingress": { "fqdn": "app.io" } },
            "items": [1, 2]
        });
        assert_eq!(
            value_at_path(&value, "configuration.ingress.fqdn"),
            Some(&json!("app.io"))
        );
        assert_eq!(value_at_path(&value, "items.1"), Some(&json!(2)));
        assert_eq!(value_at_path(&value, "configuration.missing"), None);
        assert_eq!(value_at_path(&value, ""), Some(&value));
    }

    #[tokio::test]
    async fn test_into_output_tree() {
        let (a, ra) = Output::<Value>::pending("a");
        let cell = Input::List(vec![Input::from(a), Input::from("x")]).into_output();
        assert!(cell.dependencies().contains("a"));
        ra.resolve(json!(1));
        assert_eq!(cell.resolve().await, Ok(json!([1, "x"])));
    }
}
