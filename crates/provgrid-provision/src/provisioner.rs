//! The seam between the dispatcher and whatever actually starts instances.

use std::future::Future;
use std::pin::Pin;

use provgrid_state::{ElementId, InstanceConfig, InstanceId, NodeId};

use crate::error::ProvisionResult;

/// Boxed future returned by [`Provisioner`] calls.
pub type ProvisionFuture<T> = Pin<Box<dyn Future<Output = ProvisionResult<T>> + Send>>;

/// Starts, checks and stops instances on compute nodes.
pub trait Provisioner: Send + Sync {
    /// Start an instance on `node`.
    fn instantiate(&self, node: &NodeId, config: &InstanceConfig) -> ProvisionFuture<()>;

    /// Post-provision liveness check. `Ok(false)` means not alive.
    fn verify(&self, node: &NodeId, config: &InstanceConfig) -> ProvisionFuture<bool>;

    /// Stop an instance. Called for retirement and for instances whose
    /// request was cancelled while in flight.
    fn terminate(&self, node: &NodeId, element: &ElementId, instance_id: InstanceId)
    -> ProvisionFuture<()>;
}
