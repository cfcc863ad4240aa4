//! Error types for runtime core operations.

use std::fmt;
use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Kind of registry object an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// A container record.
    Container,
    /// An image record.
    Image,
    /// An exec instance.
    Exec,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::Image => write!(f, "image"),
            Self::Exec => write!(f, "exec instance"),
        }
    }
}

/// Errors that can occur in the runtime core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Unknown id, name, or reference.
    #[error("No such {kind}: {id}")]
    NotFound {
        /// What was looked up.
        kind: ObjectKind,
        /// The reference as supplied by the caller.
        id: String,
    },

    /// A short id matched more than one object.
    #[error("No such {kind}: {id} (ambiguous reference)")]
    Ambiguous {
        /// What was looked up.
        kind: ObjectKind,
        /// The ambiguous prefix.
        id: String,
    },

    /// Duplicate container name.
    #[error(
        "Conflict. The container name \"{name}\" is already in use by container \"{holder}\". \
         You have to remove (or rename) that container to be able to reuse that name."
    )]
    NameConflict {
        /// The requested name, with leading slash.
        name: String,
        /// Id of the container holding the name.
        holder: String,
    },

    /// Operation not valid in the object's current state.
    #[error("{0}")]
    StateConflict(String),

    /// Missing or malformed input.
    #[error("{0}")]
    Validation(String),

    /// No process factory is available, or it cannot perform the request.
    #[error("{0}")]
    FactoryUnavailable(String),

    /// The backend does not implement the operation.
    #[error("{0}")]
    NotImplemented(String),

    /// Unexpected failure from the factory or the backend.
    #[error("{0}")]
    Internal(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Creates a container-not-found error.
    #[must_use]
    pub fn container_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ObjectKind::Container,
            id: id.into(),
        }
    }

    /// Creates an image-not-found error.
    #[must_use]
    pub fn image_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ObjectKind::Image,
            id: id.into(),
        }
    }

    /// Creates an exec-not-found error.
    #[must_use]
    pub fn exec_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: ObjectKind::Exec,
            id: id.into(),
        }
    }

    /// Creates a state conflict error.
    #[must_use]
    pub fn state_conflict(message: impl Into<String>) -> Self {
        Self::StateConflict(message.into())
    }

    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The "container is not running" conflict used by exec and top.
    #[must_use]
    pub fn not_running(reference: &str) -> Self {
        Self::StateConflict(format!("Container {reference} is not running"))
    }

    /// Returns true for not-found and ambiguous lookups.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Ambiguous { .. })
    }

    /// Returns true for state and name conflicts.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::StateConflict(_) | Self::NameConflict { .. })
    }
}
