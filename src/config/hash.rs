//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of configuration structures
//! and resource attributes. Fingerprints are stored with each resource
//! state so that operators can tell at a glance whether two records agree.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::model::Value;

use super::spec::{DeployConfig, ResourceConfig};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire deployment configuration.
    ///
    /// Resource order does not affect the result.
    #[must_use]
    pub fn hash_config(&self, config: &DeployConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());

        let mut resources: Vec<_> = config.resources.iter().collect();
        resources.sort_by_key(|rc| rc.id_string());
        for resource in resources {
            hasher.update(self.hash_resource_config(resource).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource declaration.
    #[must_use]
    pub fn hash_resource_config(&self, resource: &ResourceConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.id_string().as_bytes());

        let mut deps: Vec<_> = resource.depends_on.iter().collect();
        deps.sort();
        for dep in deps {
            hasher.update(b"dep:");
            hasher.update(dep.as_bytes());
        }

        for (name, value) in &resource.attributes {
            hasher.update(name.as_bytes());
            hasher.update(serde_yaml::to_string(value).unwrap_or_default().as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the fingerprint of a resource's attributes.
    ///
    /// Structurally equivalent attribute maps produce the same fingerprint:
    /// set order and duplicates are ignored, and integral floats hash like
    /// integers.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &BTreeMap<String, Value>) -> String {
        let mut hasher = Sha256::new();

        for (name, value) in attributes {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(canonical_bytes(value));
        }

        hex::encode(hasher.finalize())
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

/// Encodes a value in a canonical, type-tagged byte form.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    match value {
        Value::Null => out.push(b'n'),
        Value::Bool(b) => {
            out.push(b'b');
            out.push(u8::from(*b));
        }
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(&i.to_be_bytes());
        }
        Value::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 9.0e15 {
                out.push(b'i');
                out.extend_from_slice(&(*f as i64).to_be_bytes());
            } else {
                out.push(b'f');
                out.extend_from_slice(&f.to_bits().to_be_bytes());
            }
        }
        Value::String(s) => {
            out.push(b's');
            out.extend_from_slice(&s.len().to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::List(items) => {
            out.push(b'l');
            out.extend_from_slice(&items.len().to_be_bytes());
            for item in items {
                out.extend(canonical_bytes(item));
            }
        }
        Value::Set(items) => {
            let mut encoded: Vec<Vec<u8>> = items.iter().map(canonical_bytes).collect();
            encoded.sort();
            encoded.dedup();
            out.push(b'e');
            out.extend_from_slice(&encoded.len().to_be_bytes());
            for item in encoded {
                out.extend(item);
            }
        }
        Value::Map(map) => {
            out.push(b'm');
            out.extend_from_slice(&map.len().to_be_bytes());
            for (key, item) in map {
                out.extend_from_slice(&key.len().to_be_bytes());
                out.extend_from_slice(key.as_bytes());
                out.extend(canonical_bytes(item));
            }
        }
    }
    out
}
