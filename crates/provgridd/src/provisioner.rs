//! Provisioner used when no real node agent is attached.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use tracing::info;

use provgrid_provision::{ProvisionFuture, Provisioner};
use provgrid_state::{ElementId, InstanceConfig, InstanceId, NodeId};

/// Records placements and logs them; every instance counts as alive.
#[derive(Debug, Default)]
pub struct DryRunProvisioner {
    running: Mutex<HashSet<(NodeId, ElementId, InstanceId)>>,
}

impl DryRunProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Instances currently "running".
    pub fn running(&self) -> usize {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Provisioner for DryRunProvisioner {
    fn instantiate(&self, node: &NodeId, config: &InstanceConfig) -> ProvisionFuture<()> {
        info!(
            %node,
            element = %config.element,
            instance = config.instance_id,
            parameters = config.parameters.len(),
            "dry-run instantiate"
        );
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((node.clone(), config.element.clone(), config.instance_id));
        Box::pin(async { Ok(()) })
    }

    fn verify(&self, node: &NodeId, config: &InstanceConfig) -> ProvisionFuture<bool> {
        let alive = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&(node.clone(), config.element.clone(), config.instance_id));
        Box::pin(async move { Ok(alive) })
    }

    fn terminate(&self, node: &NodeId, element: &ElementId, instance_id: InstanceId) -> ProvisionFuture<()> {
        info!(%node, %element, instance = instance_id, "dry-run terminate");
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(node.clone(), element.clone(), instance_id));
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provgrid_state::{InstanceBounds, ServiceElement};

    #[tokio::test]
    async fn tracks_running_instances() {
        let element = ServiceElement {
            name: "api".to_string(),
            planned: 1,
            bounds: InstanceBounds { min: 0, max: 2 },
            requirements: Vec::new(),
            slots: 1,
            max_per_node: None,
            slas: Vec::new(),
            parameters: Default::default(),
        };
        let config = InstanceConfig::new("shop", &element, 1);
        let node = "n1".to_string();
        let p = DryRunProvisioner::new();

        p.instantiate(&node, &config).await.unwrap();
        assert!(p.verify(&node, &config).await.unwrap());
        assert_eq!(p.running(), 1);

        p.terminate(&node, &config.element, 1).await.unwrap();
        assert!(!p.verify(&node, &config).await.unwrap());
        assert_eq!(p.running(), 0);
    }
}
