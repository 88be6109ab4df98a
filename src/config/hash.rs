//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of configurations and
//! attribute maps. Maps are ordered (`BTreeMap`), so the JSON encoding of a
//! value is stable and can be hashed directly.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::spec::StackConfig;
use crate::graph::AttributeMap;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire stack configuration.
    ///
    /// This hash changes when any part of the configuration changes.
    #[must_use]
    pub fn hash_config(&self, config: &StackConfig) -> String {
        hash_serialized(config)
    }

    /// Computes a hash of everything a plan was derived from: the
    /// configuration, the selected environment and variable overrides.
    #[must_use]
    pub fn hash_inputs(
        &self,
        config: &StackConfig,
        environment: &str,
        overrides: &BTreeMap<String, Value>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.hash_config(config).as_bytes());
        hasher.update(environment.as_bytes());
        hasher.update(hash_serialized(overrides).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Computes a hash of a concrete attribute map.
    #[must_use]
    pub fn hash_attributes(attributes: &AttributeMap) -> String {
        hash_serialized(attributes)
    }

    /// Computes a short hash (first 12 characters) for display purposes.
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        &hash[..hash.len().min(12)]
    }

    /// Checks if two hashes match.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        hash1 == hash2
    }
}

fn hash_serialized<T: Serialize + ?Sized>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> StackConfig {
        serde_yaml::from_str(
            r#"
project:
  name: demo
resources:
  - type: network
    name: main
    attributes:
      cidr: "10.0.0.0/16"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let config = config();

        let hash1 = hasher.hash_config(&config);
        let hash2 = hasher.hash_config(&config);

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_hash_changes_with_config() {
        let hasher = ConfigHasher::new();
        let config1 = config();
        let mut config2 = config();
        config2.resources[0]
            .attributes
            .insert(String::from("cidr"), json!("10.1.0.0/16"));

        assert_ne!(hasher.hash_config(&config1), hasher.hash_config(&config2));
    }

    #[test]
    fn test_hash_inputs_include_environment() {
        let hasher = ConfigHasher::new();
        let config = config();
        let none = BTreeMap::new();

        let dev = hasher.hash_inputs(&config, "dev", &none);
        let prod = hasher.hash_inputs(&config, "prod", &none);
        assert_ne!(dev, prod);

        let overrides = BTreeMap::from([(String::from("cidr"), json!("x"))]);
        assert_ne!(dev, hasher.hash_inputs(&config, "dev", &overrides));
    }

    #[test]
    fn test_attribute_hash_ignores_insertion_order() {
        let mut a = AttributeMap::new();
        a.insert(String::from("x"), json!(1));
        a.insert(String::from("y"), json!({"b": 2, "a": 1}));

        let mut b = AttributeMap::new();
        b.insert(String::from("y"), json!({"a": 1, "b": 2}));
        b.insert(String::from("x"), json!(1));

        assert_eq!(
            ConfigHasher::hash_attributes(&a),
            ConfigHasher::hash_attributes(&b)
        );
    }

    #[test]
    fn test_short_hash() {
        let hash = "abcdef1234567890abcdef";
        assert_eq!(ConfigHasher::short_hash(hash), "abcdef123456");
        assert_eq!(ConfigHasher::short_hash("abc"), "abc");
    }
}
