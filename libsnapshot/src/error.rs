//! Snapshot controller error types.
//!
//! All errors in the `libsnapshot` crate are represented by the
//! [`SnapshotError`] enum.  The controller distinguishes *transient* failures
//! (retried through queue backoff) from *final* ones (recorded on the object
//! and left for an operator) via [`SnapshotError::is_retryable`].

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = SnapshotError> = std::result::Result<T, E>;

/// Unified error type for store, backend and reconciliation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The requested object does not exist in the store.
    #[error("{kind} {key} not found")]
    NotFound {
        /// Object kind, e.g. `"SnapshotContent"`.
        kind: &'static str,
        /// Namespace/name key of the object.
        key: String,
    },

    /// An object with the same key already exists.
    #[error("{kind} {key} already exists")]
    AlreadyExists {
        /// Object kind.
        kind: &'static str,
        /// Namespace/name key of the object.
        key: String,
    },

    /// Optimistic concurrency check failed: the object changed concurrently.
    #[error("conflict updating {kind} {key}: the object has been modified")]
    Conflict {
        /// Object kind.
        kind: &'static str,
        /// Namespace/name key of the object.
        key: String,
    },

    /// A resource version that is not an ordered integer token.
    #[error("invalid resource version {0:?}")]
    InvalidResourceVersion(String),

    /// The object carries no name, so no cache key can be derived.
    #[error("object has no extractable key")]
    MissingKey,

    /// The storage backend returned an error.
    #[error("backend error: {message}")]
    Backend {
        /// Human-readable failure reason.
        message: String,
        /// Whether the backend classified the failure as retryable.
        retryable: bool,
    },

    /// A backend call exceeded the configured operation timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The caller or the object supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The snapshot source is not usable yet, e.g. its claim is unbound.
    #[error("snapshot source not ready: {0}")]
    SourceNotReady(String),

    /// A request and its content no longer agree on their binding.
    #[error("snapshot binding broken: {0}")]
    Misbound(String),

    /// A named operation with the same name is already running.
    #[error("operation {0} is already in flight")]
    OperationInFlight(String),

    /// A named operation failed recently and is still backing off.
    #[error("operation {name} failed recently, retry permitted in {remaining:?}")]
    OperationBackoff {
        /// Operation name.
        name: String,
        /// Time left before the operation may run again.
        remaining: std::time::Duration,
    },

    /// An explicitly named snapshot class does not exist.
    #[error("snapshot class {0} not found")]
    ClassNotFound(String),

    /// No class is annotated as default for the driver.
    #[error("cannot find default snapshot class for driver {0}")]
    NoDefaultClass(String),

    /// More than one class is annotated as default for the driver.
    #[error("{count} default snapshot classes exist for driver {driver}")]
    AmbiguousDefaultClass {
        /// Backend driver name.
        driver: String,
        /// Number of competing default classes.
        count: usize,
    },

    /// Secret templates could not be resolved or fetched.
    #[error("secret error: {0}")]
    Secret(String),

    /// An object could not be converted to or from JSON.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SnapshotError {
    /// Create a non-retryable [`SnapshotError::Backend`] from anything that
    /// implements [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::Backend {
            message: e.to_string(),
            retryable: false,
        }
    }

    /// Create a retryable [`SnapshotError::Backend`].
    pub fn backend_retryable<E: std::fmt::Display>(e: E) -> Self {
        Self::Backend {
            message: e.to_string(),
            retryable: true,
        }
    }

    /// Create a [`SnapshotError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Shorthand for [`SnapshotError::NotFound`].
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Shorthand for [`SnapshotError::Conflict`].
    pub fn conflict(kind: &'static str, key: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            key: key.into(),
        }
    }

    /// Whether retrying the same operation later can succeed without
    /// external intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Conflict { .. }
            | Self::NotFound { .. }
            | Self::Timeout(_)
            | Self::OperationInFlight(_)
            | Self::OperationBackoff { .. }
            | Self::SourceNotReady(_)
            | Self::Secret(_) => true,
            Self::Backend { retryable, .. } => *retryable,
            Self::AlreadyExists { .. }
            | Self::InvalidResourceVersion(_)
            | Self::MissingKey
            | Self::InvalidArgument(_)
            | Self::Misbound(_)
            | Self::ClassNotFound(_)
            | Self::NoDefaultClass(_)
            | Self::AmbiguousDefaultClass { .. }
            | Self::Serialization(_)
            | Self::Internal(_) => false,
        }
    }

    /// Whether this is a store version conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether this is a store not-found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
