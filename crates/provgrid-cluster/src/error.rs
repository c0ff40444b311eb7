//! Error types for the registry and leader gate.

use thiserror::Error;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    /// A mutating call was made on a replica that does not hold the token.
    #[error("replica {replica} is not the leader")]
    NotLeader { replica: String },

    #[error("unknown compute node: {0}")]
    UnknownNode(String),

    /// The capability feed could not produce a snapshot.
    #[error("capability feed error: {0}")]
    Feed(String),
}
