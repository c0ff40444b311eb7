//! Error types for the deployment state tracker.

use thiserror::Error;

/// Result type alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// Malformed deployment declaration, rejected at deploy time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operational string already deployed: {0}")]
    AlreadyDeployed(String),

    #[error("operational string not deployed: {0}")]
    NotDeployed(String),

    #[error("service element not found: {0}")]
    ElementNotFound(String),

    #[error("instance not found: {element}#{instance}")]
    InstanceNotFound { element: String, instance: u64 },

    #[error("illegal transition for {element}#{instance}: {from} -> {to}")]
    IllegalTransition {
        element: String,
        instance: u64,
        from: String,
        to: String,
    },

    /// Internal consistency failure; the element is paused.
    #[error("invariant violation on {element}: {detail}")]
    InvariantViolation { element: String, detail: String },
}
