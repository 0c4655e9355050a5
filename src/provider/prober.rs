//! Current-state probing and drift detection.
//!
//! The prober asks the provider for the live state of every resource the
//! store knows about and compares it with what was last applied. Only
//! attributes the engine manages are compared; anything else the target
//! reports is ignored.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, ProviderError, Result};
use crate::model::{ResourceId, Value};
use crate::state::ResourceState;

use super::{Provider, ProviderState};

/// How a resource differs from its last-applied state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Drift {
    /// The resource no longer exists on the target.
    Missing,
    /// Managed attributes have different values on the target.
    Changed {
        /// Observed value of each drifted attribute, `None` if absent.
        attributes: BTreeMap<String, Option<Value>>,
    },
}

/// Result of probing every recorded resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriftReport {
    /// Drifted resources.
    pub entries: BTreeMap<ResourceId, Drift>,
    /// Number of resources probed.
    pub checked: usize,
}

impl DriftReport {
    /// Returns true if nothing drifted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of drifted resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns the drift recorded for a resource.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&Drift> {
        self.entries.get(id)
    }
}

/// Probes the target for drift.
pub struct Prober {
    provider: Arc<dyn Provider>,
    workers: usize,
}

impl Prober {
    /// Creates a prober that runs up to `workers` probes at once.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, workers: usize) -> Self {
        Self {
            provider,
            workers: workers.max(1),
        }
    }

    /// Probes every resource in `states` and reports what drifted.
    ///
    /// # Errors
    ///
    /// Returns the first provider error encountered.
    pub async fn detect(&self, states: &BTreeMap<ResourceId, ResourceState>) -> Result<DriftReport> {
        info!(
            "Probing {} resources through the {} provider",
            states.len(),
            self.provider.name()
        );

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut join_set = JoinSet::new();

        for id in states.keys() {
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&semaphore);
            let id = id.clone();

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let observed = provider.probe(&id).await;
                (id, observed)
            });
        }

        let mut observations: Vec<(ResourceId, std::result::Result<Option<ProviderState>, ProviderError>)> =
            Vec::with_capacity(states.len());
        while let Some(joined) = join_set.join_next().await {
            let observation =
                joined.map_err(|e| ConvergeError::internal(format!("Probe task failed: {e}")))?;
            observations.push(observation);
        }
        observations.sort_by(|a, b| a.0.cmp(&b.0));

        let mut report = DriftReport {
            entries: BTreeMap::new(),
            checked: states.len(),
        };

        for (id, observed) in observations {
            let observed = observed.map_err(|e| {
                warn!("Probe of {id} failed: {e}");
                e
            })?;

            let Some(recorded) = states.get(&id) else {
                continue;
            };

            if let Some(drift) = compare(recorded, observed.as_ref()) {
                debug!("Drift detected on {id}: {drift:?}");
                report.entries.insert(id, drift);
            }
        }

        info!(
            "Drift check complete: {} of {} resources drifted",
            report.len(),
            report.checked
        );
        Ok(report)
    }
}

/// Compares a recorded state with an observation.
fn compare(recorded: &ResourceState, observed: Option<&ProviderState>) -> Option<Drift> {
    let Some(observed) = observed else {
        return Some(Drift::Missing);
    };

    let attributes: BTreeMap<String, Option<Value>> = recorded
        .applied
        .iter()
        .filter_map(|(name, expected)| match observed.attributes.get(name) {
            Some(actual) if actual.equivalent(expected) => None,
            actual => Some((name.clone(), actual.cloned())),
        })
        .collect();

    if attributes.is_empty() {
        None
    } else {
        Some(Drift::Changed { attributes })
    }
}
