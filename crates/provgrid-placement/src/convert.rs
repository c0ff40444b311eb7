//! Type conversions between the deployment model and placement types.
//!
//! Bridges `provgrid_state::ServiceElement` to the placement engine's
//! [`Demand`].

use provgrid_state::{NodeId, ServiceElement};

use crate::scorer::Demand;

/// Build the placement demand for one instance of `element`.
pub fn element_to_demand(element: &ServiceElement) -> Demand {
    Demand {
        requirements: element.requirements.clone(),
        slots: element.slots,
        max_per_node: element.max_per_node,
        excluded: Vec::new(),
    }
}

/// Same as [`element_to_demand`], but never place on `node`.
pub fn relocation_demand(element: &ServiceElement, node: &NodeId) -> Demand {
    let mut demand = element_to_demand(element);
    demand.excluded.push(node.clone());
    demand
}
