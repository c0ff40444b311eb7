//! Provisioning error types.

use thiserror::Error;

/// Errors that can occur while provisioning an instance.
///
/// Everything except `State` and `Closed` is transient from the
/// dispatcher's point of view and leads to a retry with backoff.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// No node satisfies the hard requirements right now.
    #[error("no candidate node: {0}")]
    NoCandidate(String),

    /// The chosen node could not be claimed against the latest snapshot.
    #[error("node {0} no longer feasible")]
    StaleSelection(String),

    #[error("instantiate on {node} failed: {reason}")]
    Instantiate { node: String, reason: String },

    /// Post-provision liveness check did not pass.
    #[error("liveness check on {node} failed: {reason}")]
    Liveness { node: String, reason: String },

    #[error("terminate on {node} failed: {reason}")]
    Terminate { node: String, reason: String },

    #[error("state error: {0}")]
    State(#[from] provgrid_state::StateError),

    #[error("provision queue closed")]
    Closed,
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
