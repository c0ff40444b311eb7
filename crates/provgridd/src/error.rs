//! Orchestrator errors.

use thiserror::Error;

use provgrid_autoscale::RuleError;
use provgrid_cluster::ClusterError;
use provgrid_state::StateError;
use provgrid_watch::WatchError;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Rejected declaration or illegal state transition.
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Rules(#[from] RuleError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    /// Mutating call on a standby replica.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl OrchestratorError {
    /// Whether the call was refused because this replica is not leader.
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Self::Cluster(ClusterError::NotLeader { .. }))
    }
}
