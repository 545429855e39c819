//! Hashing for change detection.
//!
//! This module provides deterministic hashing of resource inputs and whole
//! stacks, so a snapshot can record what a resource was created from and a
//! report can identify which stack revision it applied.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::spec::StackConfig;

/// Hasher for computing input and stack hashes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of a resource's resolved inputs.
    ///
    /// Object keys are visited in sorted order, so the hash does not depend
    /// on declaration order.
    #[must_use]
    pub fn hash_properties(&self, properties: &Map<String, Value>) -> String {
        let mut hasher = Sha256::new();
        let mut keys: Vec<_> = properties.keys().collect();
        keys.sort();
        for key in keys {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            Self::hash_value(&mut hasher, &properties[key.as_str()]);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a hash of an entire stack.
    #[must_use]
    pub fn hash_stack(&self, config: &StackConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());

        for variable in &config.variables {
            hasher.update(variable.name.as_bytes());
            hasher.update(variable.invoke.as_bytes());
            for (key, value) in &variable.arguments {
                hasher.update(key.as_bytes());
                Self::hash_value(&mut hasher, value);
            }
        }

        for resource in &config.resources {
            hasher.update(resource.name.as_bytes());
            hasher.update(resource.type_token.as_bytes());
            for (key, value) in &resource.properties {
                hasher.update(key.as_bytes());
                Self::hash_value(&mut hasher, value);
            }
            for dep in &resource.effective_options().depends_on {
                hasher.update(dep.as_bytes());
            }
        }

        for (name, value) in &config.outputs {
            hasher.update(name.as_bytes());
            Self::hash_value(&mut hasher, value);
        }

        hex::encode(hasher.finalize())
    }

    fn hash_value(hasher: &mut Sha256, value: &Value) {
        match value {
            Value::Null => hasher.update([0u8]),
            Value::Bool(b) => hasher.update([1u8, u8::from(*b)]),
            Value::Number(n) => {
                hasher.update([2u8]);
                hasher.update(n.to_string().as_bytes());
            }
            Value::String(s) => {
                hasher.update([3u8]);
                hasher.update((s.len() as u64).to_be_bytes());
                hasher.update(s.as_bytes());
            }
            Value::Array(items) => {
                hasher.update([4u8]);
                hasher.update((items.len() as u64).to_be_bytes());
                for item in items {
                    Self::hash_value(hasher, item);
                }
            }
            Value::Object(map) => {
                hasher.update([5u8]);
                hasher.update((map.len() as u64).to_be_bytes());
                let mut keys: Vec<_> = map.keys().collect();
                keys.sort();
                for key in keys {
                    hasher.update(key.as_bytes());
                    hasher.update([0u8]);
                    Self::hash_value(hasher, &map[key.as_str()]);
                }
            }
        }
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
