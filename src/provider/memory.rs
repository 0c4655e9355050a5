//! In-process provider with fault injection.
//!
//! Keeps managed objects in memory and records every call with its start
//! and end instants, which makes it the workhorse of the engine's tests.
//! Failures, latency and out-of-band changes can be injected per resource.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::ProviderError;
use crate::model::{ResourceId, Value};

use super::{ApplyRequest, Operation, Provider, ProviderState};

/// What a recorded call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// A probe.
    Probe,
    /// An apply with the given operation.
    Apply(Operation),
}

/// A recorded provider call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Target resource.
    pub id: ResourceId,
    /// Call type.
    pub kind: CallKind,
    /// When the call started.
    pub started_at: Instant,
    /// When the call returned.
    pub finished_at: Instant,
    /// Whether the call succeeded.
    pub succeeded: bool,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<ResourceId, ProviderState>,
    permanent_failures: BTreeSet<ResourceId>,
    transient_failures: BTreeMap<ResourceId, u32>,
    latency: BTreeMap<ResourceId, Duration>,
    calls: Vec<CallRecord>,
    next_uid: u64,
}

/// Provider backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
    default_latency: Duration,
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a latency applied to every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    /// Makes every apply of `id` fail permanently.
    pub async fn fail_permanently(&self, id: ResourceId) {
        self.inner.lock().await.permanent_failures.insert(id);
    }

    /// Makes the next `times` applies of `id` fail transiently.
    pub async fn fail_transiently(&self, id: ResourceId, times: u32) {
        self.inner.lock().await.transient_failures.insert(id, times);
    }

    /// Sets a latency for calls on one resource.
    pub async fn set_latency(&self, id: ResourceId, latency: Duration) {
        self.inner.lock().await.latency.insert(id, latency);
    }

    /// Replaces an object's attributes out of band, simulating drift.
    pub async fn set_attribute(&self, id: &ResourceId, name: &str, value: Value) {
        if let Some(object) = self.inner.lock().await.objects.get_mut(id) {
            object.attributes.insert(name.to_string(), value);
        }
    }

    /// Removes an object out of band, simulating drift.
    pub async fn remove_object(&self, id: &ResourceId) -> Option<ProviderState> {
        self.inner.lock().await.objects.remove(id)
    }

    /// Returns a managed object.
    pub async fn object(&self, id: &ResourceId) -> Option<ProviderState> {
        self.inner.lock().await.objects.get(id).cloned()
    }

    /// Returns the identifiers of every managed object.
    pub async fn object_ids(&self) -> Vec<ResourceId> {
        self.inner.lock().await.objects.keys().cloned().collect()
    }

    /// Returns every recorded call in completion order.
    pub async fn calls(&self) -> Vec<CallRecord> {
        self.inner.lock().await.calls.clone()
    }

    /// Returns recorded apply calls only.
    pub async fn apply_calls(&self) -> Vec<CallRecord> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| matches!(c.kind, CallKind::Apply(_)))
            .collect()
    }

    /// Clears the call log.
    pub async fn clear_calls(&self) {
        self.inner.lock().await.calls.clear();
    }

    async fn delay_for(&self, id: &ResourceId) {
        let latency = self
            .inner
            .lock()
            .await
            .latency
            .get(id)
            .copied()
            .unwrap_or(self.default_latency);

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    async fn record(&self, id: &ResourceId, kind: CallKind, started_at: Instant, succeeded: bool) {
        self.inner.lock().await.calls.push(CallRecord {
            id: id.clone(),
            kind,
            started_at,
            finished_at: Instant::now(),
            succeeded,
        });
    }

    async fn perform(&self, request: &ApplyRequest) -> Result<ProviderState, ProviderError> {
        let mut inner = self.inner.lock().await;

        if inner.permanent_failures.contains(&request.id) {
            return Err(ProviderError::permanent(format!(
                "{} rejected by target",
                request.id
            )));
        }

        if let Some(remaining) = inner.transient_failures.get_mut(&request.id)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ProviderError::transient(format!(
                "{} temporarily unavailable",
                request.id
            )));
        }

        match request.operation {
            Operation::Create | Operation::Update => {
                let uid = match inner.objects.get(&request.id) {
                    Some(existing) => existing.outputs.get("uid").cloned(),
                    None => request.previous_outputs.get("uid").cloned(),
                };
                let uid = if let Some(uid) = uid {
                    uid
                } else {
                    inner.next_uid += 1;
                    Value::String(format!("mem-{}", inner.next_uid))
                };

                let state = ProviderState {
                    attributes: request.attributes.clone(),
                    outputs: BTreeMap::from([(String::from("uid"), uid)]),
                };
                inner.objects.insert(request.id.clone(), state.clone());
                Ok(state)
            }
            Operation::Delete => {
                inner.objects.remove(&request.id);
                Ok(ProviderState::default())
            }
        }
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn probe(&self, id: &ResourceId) -> Result<Option<ProviderState>, ProviderError> {
        let started_at = Instant::now();
        self.delay_for(id).await;
        let state = self.inner.lock().await.objects.get(id).cloned();
        self.record(id, CallKind::Probe, started_at, true).await;
        Ok(state)
    }

    async fn apply(&self, request: &ApplyRequest) -> Result<ProviderState, ProviderError> {
        let started_at = Instant::now();
        self.delay_for(&request.id).await;
        let result = self.perform(request).await;
        self.record(
            &request.id,
            CallKind::Apply(request.operation),
            started_at,
            result.is_ok(),
        )
        .await;
        result
    }
}
