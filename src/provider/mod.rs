//! Providers perform the actual work against a target.
//!
//! The engine never talks to a target directly. It asks a [`Provider`] to
//! probe the current state of a resource and to apply a create, update or
//! delete. Providers classify their failures as transient or permanent so
//! the executor knows whether a retry can help.

mod local;
mod memory;
mod prober;

pub use local::LocalProvider;
pub use memory::{CallKind, CallRecord, MemoryProvider};
pub use prober::{Drift, DriftReport, Prober};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ProviderError;
use crate::model::{ResourceId, Value};

/// State of a resource as reported by a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderState {
    /// Attribute values as they exist on the target.
    pub attributes: BTreeMap<String, Value>,
    /// Computed values such as generated identifiers.
    pub outputs: BTreeMap<String, Value>,
}

/// Mutating operation requested from a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Bring a new resource into existence.
    Create,
    /// Modify an existing resource in place.
    Update,
    /// Remove a resource.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A single apply call.
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyRequest {
    /// Target resource.
    pub id: ResourceId,
    /// Requested operation.
    pub operation: Operation,
    /// Interpolation-resolved attribute values. Empty for deletes.
    pub attributes: BTreeMap<String, Value>,
    /// Outputs recorded by the previous apply, if any.
    pub previous_outputs: BTreeMap<String, Value>,
}

/// Trait for target providers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Gets the provider name.
    fn name(&self) -> &'static str;

    /// Reads the current state of a resource, or `None` if it does not exist.
    async fn probe(&self, id: &ResourceId) -> Result<Option<ProviderState>, ProviderError>;

    /// Performs a create, update or delete.
    ///
    /// Deletes of resources that no longer exist succeed.
    async fn apply(&self, request: &ApplyRequest) -> Result<ProviderState, ProviderError>;
}
