//! State types for tracking applied resources.
//!
//! These types represent the last-applied state of each resource, used as
//! the baseline for the next run's diff and for idempotent re-runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::ConfigHasher;
use crate::model::{ResourceId, Value};

/// Current version of the state record format.
pub const STATE_VERSION: &str = "1.0";

/// Number of run history entries kept.
const MAX_HISTORY: usize = 100;

/// Last-applied state of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// State format version.
    pub version: String,
    /// Resource identifier.
    pub id: ResourceId,
    /// Declared attribute values as last applied, before interpolation.
    pub attributes: BTreeMap<String, Value>,
    /// Attribute values sent to the provider, after interpolation.
    #[serde(default)]
    pub applied: BTreeMap<String, Value>,
    /// Computed values reported by the provider after apply.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Dependencies in effect when the resource was applied.
    #[serde(default)]
    pub dependencies: Vec<ResourceId>,
    /// Hash of the declared attributes.
    pub fingerprint: String,
    /// Number of successful applies, starting at 1 on create.
    pub revision: u64,
    /// When the resource was last applied.
    pub last_applied: DateTime<Utc>,
}

/// A record of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// Run identifier.
    pub run_id: String,
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Whether every resource converged.
    pub success: bool,
    /// Number of resources created, updated or deleted.
    pub changed: usize,
    /// Number of resources that failed.
    pub failed: usize,
    /// Number of resources skipped.
    pub skipped: usize,
    /// Whether the run was cancelled.
    #[serde(default)]
    pub cancelled: bool,
    /// Error text when the run did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResourceState {
    /// Creates a first-revision state from declared attributes.
    #[must_use]
    pub fn new(id: ResourceId, attributes: BTreeMap<String, Value>) -> Self {
        let fingerprint = ConfigHasher::new().hash_attributes(&attributes);
        Self {
            version: STATE_VERSION.to_string(),
            id,
            applied: attributes.clone(),
            attributes,
            outputs: BTreeMap::new(),
            dependencies: Vec::new(),
            fingerprint,
            revision: 1,
            last_applied: Utc::now(),
        }
    }

    /// Sets the interpolated values that were sent to the provider.
    #[must_use]
    pub fn with_applied(mut self, applied: BTreeMap<String, Value>) -> Self {
        self.applied = applied;
        self
    }

    /// Sets the provider-computed outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: BTreeMap<String, Value>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Sets the dependencies in effect at apply time.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<ResourceId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Continues the revision sequence of a previous state.
    #[must_use]
    pub fn succeeding(mut self, previous: Option<&Self>) -> Self {
        self.revision = previous.map_or(1, |p| p.revision.saturating_add(1));
        self
    }

    /// Looks up a value for interpolation, preferring outputs over attributes.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.outputs
            .get(name)
            .or_else(|| self.applied.get(name))
            .or_else(|| self.attributes.get(name))
    }
}

impl RunHistoryEntry {
    /// Appends an entry to a history list, keeping only the most recent ones.
    pub fn push_bounded(history: &mut Vec<Self>, entry: Self) {
        if history.len() >= MAX_HISTORY {
            let excess = history.len() + 1 - MAX_HISTORY;
            history.drain(..excess);
        }
        history.push(entry);
    }
}
