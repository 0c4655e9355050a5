//! Error types for the convergence engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration loading, dependency graph construction, state management,
//! provider calls, and the reconciliation run itself.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the convergence engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Dependency graph errors.
    #[error("Dependency graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Two resources share the same identifier.
    #[error("Duplicate resource: {id}")]
    DuplicateResource {
        /// The duplicated identifier.
        id: String,
    },

    /// A resource references a resource that is not declared.
    #[error("Resource '{resource}' references undeclared resource '{reference}'")]
    UnknownReference {
        /// Resource holding the reference.
        resource: String,
        /// The unresolved reference.
        reference: String,
    },
}

/// Dependency graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected between: {}", .members.join(", "))]
    Cycle {
        /// Identifiers of every resource participating in the cycle.
        members: Vec<String>,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed for a reason other than contention.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another run.
    #[error("State is locked by run {run_id} (holder: {holder}, since: {since})")]
    LockHeld {
        /// Run identifier owning the lock.
        run_id: String,
        /// Identifier of the lock holder process.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Storage I/O error.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderErrorKind {
    /// The operation may succeed if retried.
    Transient,
    /// Retrying will not help.
    Permanent,
}

/// An error returned by a provider.
#[derive(Debug, Clone, Error)]
#[error("{kind} failure: {message}")]
pub struct ProviderError {
    /// Whether the failure is retryable.
    pub kind: ProviderErrorKind,
    /// Description of the failure.
    pub message: String,
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The run completed but at least one resource failed.
    #[error("Run {run_id} finished with {failed} failed and {skipped} skipped resources")]
    RunFailed {
        /// Run identifier.
        run_id: String,
        /// Number of failed resources.
        failed: usize,
        /// Number of skipped resources.
        skipped: usize,
    },

    /// The run was aborted before execution.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for convergence operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error aborts a run before any mutation.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Graph(_) | Self::State(StateError::LockHeld { .. })
        )
    }
}

impl ConfigError {
    /// Creates a parse error with an optional location.
    #[must_use]
    pub fn parse(message: impl Into<String>, location: Option<String>) -> Self {
        Self::ParseError {
            message: message.into(),
            location,
        }
    }

    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl StateError {
    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a retryable provider error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Creates a non-retryable provider error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Returns true if the operation may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self.kind, ProviderErrorKind::Transient)
    }

    /// Classifies an I/O error raised while talking to a target.
    #[must_use]
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        let message = format!("{context}: {err}");
        match err.kind() {
            ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::ResourceBusy
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => Self::transient(message),
            _ => Self::permanent(message),
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_members() {
        let err = GraphError::Cycle {
            members: vec![String::from("svc.a"), String::from("svc.b")],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected between: svc.a, svc.b");
    }

    #[test]
    fn test_fatal_classification() {
        let lock = ConvergeError::State(StateError::LockHeld {
            run_id: String::from("r1"),
            holder: String::from("host"),
            since: String::from("now"),
        });
        assert!(lock.is_fatal());

        let storage = ConvergeError::State(StateError::storage("disk full"));
        assert!(!storage.is_fatal());
    }

    #[test]
    fn test_io_classification() {
        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(ProviderError::from_io("write", &timed_out).is_transient());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert!(!ProviderError::from_io("write", &denied).is_transient());
    }
}
