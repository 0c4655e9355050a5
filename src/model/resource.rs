//! Declared resources.

use std::collections::{BTreeMap, BTreeSet};

use super::id::ResourceId;
use super::reference::{Reference, scan_references};
use super::value::Value;

/// A declared unit of desired state.
///
/// Loaded fresh for each run and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Unique identifier.
    pub id: ResourceId,
    /// Desired attribute values.
    pub attributes: BTreeMap<String, Value>,
    /// Explicitly declared dependencies.
    pub depends_on: Vec<ResourceId>,
}

impl Resource {
    /// Creates a resource with no attributes or dependencies.
    #[must_use]
    pub const fn new(id: ResourceId) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, id: ResourceId) -> Self {
        self.depends_on.push(id);
        self
    }

    /// Returns every interpolation reference in this resource's attributes.
    #[must_use]
    pub fn references(&self) -> Vec<Reference> {
        self.attributes.values().flat_map(scan_references).collect()
    }

    /// Returns the resources this one implicitly depends on.
    #[must_use]
    pub fn implicit_dependencies(&self) -> BTreeSet<ResourceId> {
        self.references().into_iter().map(|r| r.target).collect()
    }

    /// Returns explicit and implicit dependencies combined.
    #[must_use]
    pub fn all_dependencies(&self) -> BTreeSet<ResourceId> {
        let mut deps = self.implicit_dependencies();
        deps.extend(self.depends_on.iter().cloned());
        deps
    }
}
