//! Change plan types.
//!
//! A plan lists one action per resource, sorted by identifier. Plans are
//! computed fresh for every run and never persisted.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

use crate::model::{ResourceId, Value};
use crate::provider::Operation;

/// A complete change plan.
#[derive(Debug, Clone, Serialize)]
pub struct ChangePlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Actions sorted by resource identifier.
    pub actions: Vec<Action>,
}

/// Planned action for a single resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    /// Target resource.
    pub id: ResourceId,
    /// What to do.
    pub kind: ActionKind,
    /// Attribute-level changes (empty for creates, deletes and no-ops).
    pub changes: Vec<AttributeChange>,
    /// Why this action was chosen.
    pub reason: String,
}

/// Types of planned actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Create a new resource.
    Create,
    /// Update an existing resource.
    Update,
    /// Delete a resource no longer declared.
    Delete,
    /// Nothing to do.
    NoOp,
}

/// A single attribute difference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub name: String,
    /// Current value, `None` if the attribute did not exist.
    pub old: Option<Value>,
    /// Desired value, `None` if the attribute was removed.
    pub new: Option<Value>,
}

impl ChangePlan {
    /// Creates a plan, sorting actions by identifier.
    #[must_use]
    pub fn new(mut actions: Vec<Action>) -> Self {
        actions.sort_by(|a, b| a.id.cmp(&b.id));
        Self {
            created_at: Utc::now(),
            actions,
        }
    }

    /// Returns true if no action changes anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.iter().all(|a| a.kind == ActionKind::NoOp)
    }

    /// Returns the actions that change something.
    pub fn changes(&self) -> impl Iterator<Item = &Action> {
        self.actions.iter().filter(|a| a.kind != ActionKind::NoOp)
    }

    /// Counts actions of one kind.
    #[must_use]
    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }

    /// Finds the action for a resource.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&Action> {
        self.actions
            .binary_search_by(|a| a.id.cmp(id))
            .ok()
            .map(|i| &self.actions[i])
    }

    /// Returns a one-line summary such as `2 to create, 1 to update, 0 to delete`.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.count(ActionKind::Create),
            self.count(ActionKind::Update),
            self.count(ActionKind::Delete),
            self.count(ActionKind::NoOp)
        )
    }
}

impl Action {
    /// Creates an action with no attribute changes.
    #[must_use]
    pub fn new(id: ResourceId, kind: ActionKind, reason: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            changes: Vec::new(),
            reason: reason.into(),
        }
    }

    /// Returns the provider operation for this action, if any.
    #[must_use]
    pub const fn operation(&self) -> Option<Operation> {
        match self.kind {
            ActionKind::Create => Some(Operation::Create),
            ActionKind::Update => Some(Operation::Update),
            ActionKind::Delete => Some(Operation::Delete),
            ActionKind::NoOp => None,
        }
    }

    /// Returns the names of changed attributes.
    #[must_use]
    pub fn changed_names(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.name.as_str()).collect()
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::NoOp => "NOOP",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.old, &self.new) {
            (Some(old), Some(new)) => write!(f, "{}: {old} -> {new}", self.name),
            (None, Some(new)) => write!(f, "{}: (none) -> {new}", self.name),
            (Some(old), None) => write!(f, "{}: {old} -> (removed)", self.name),
            (None, None) => write!(f, "{}", self.name),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl fmt::Display for ChangePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Change Plan ({}):", self.summary())?;
        for (i, action) in self.changes().enumerate() {
            writeln!(f, "  {}. {action}", i + 1)?;
            for change in &action.changes {
                writeln!(f, "       {change}")?;
            }
        }
        Ok(())
    }
}
