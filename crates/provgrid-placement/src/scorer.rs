//! Node scoring for placement decisions.
//!
//! Evaluates candidate nodes using a weighted combination of:
//! - **Load**: prefer nodes with low measured load
//! - **Capacity**: prefer nodes with slot headroom left after placement
//! - **Affinity**: prefer nodes not already hosting the same element
//!
//! Hard requirements (capabilities, slots, max-per-node, draining) are
//! checked first; a node failing any of them is rejected, never scored.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use provgrid_state::{NodeId, NodeSnapshot, Requirement};

/// What a single instance needs from a node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Demand {
    /// Hard capability requirements (all must hold).
    pub requirements: Vec<Requirement>,
    /// Slots consumed per instance.
    pub slots: u32,
    /// Maximum instances of the element per node.
    pub max_per_node: Option<u32>,
    /// Nodes that must not be chosen (e.g. the current host during relocation).
    pub excluded: Vec<NodeId>,
}

/// Why a node was not a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Draining,
    Excluded,
    Requirement(String),
    Slots { free: u32, needed: u32 },
    MaxPerNode(u32),
}

/// Scored placement result for a single node.
#[derive(Debug, Clone)]
pub struct NodeScore {
    pub node_id: NodeId,
    /// Total composite score (higher = better). Range: 0.0..=100.0 for
    /// weights summing to 1.
    pub score: f64,
    /// Breakdown of score components.
    pub breakdown: ScoreBreakdown,
}

/// Individual score components for debugging.
#[derive(Debug, Clone, Copy)]
pub struct ScoreBreakdown {
    /// Inverse load: 100 for an idle node, 0 for a saturated one.
    pub load: f64,
    /// Share of slots still free after placement.
    pub capacity: f64,
    /// Anti-affinity: 100 when the node hosts none of this element.
    pub affinity: f64,
}

/// Weights for the scoring components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub load: f64,
    pub capacity: f64,
    pub affinity: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            load: 0.5,
            capacity: 0.3,
            affinity: 0.2,
        }
    }
}

/// Check hard constraints for placing one more instance on `node`.
pub fn check_feasible(node: &NodeSnapshot, demand: &Demand, hosted: u32) -> Result<(), Rejection> {
    if node.draining {
        return Err(Rejection::Draining);
    }
    if demand.excluded.iter().any(|n| n == &node.id) {
        return Err(Rejection::Excluded);
    }
    if let Some(req) = demand
        .requirements
        .iter()
        .find(|r| !r.is_satisfied_by(&node.capabilities))
    {
        return Err(Rejection::Requirement(req.capability.clone()));
    }
    if node.free_slots() < demand.slots {
        return Err(Rejection::Slots {
            free: node.free_slots(),
            needed: demand.slots,
        });
    }
    if let Some(max) = demand.max_per_node
        && hosted >= max
    {
        return Err(Rejection::MaxPerNode(max));
    }
    Ok(())
}

/// Weighted desirability of `node` for an instance, ignoring feasibility.
///
/// `hosted` is the number of instances of the element already on the node.
pub fn fitness(node: &NodeSnapshot, demand: &Demand, hosted: u32, weights: &ScoringWeights) -> NodeScore {
    // An unreadable load counts as saturated.
    let measured = if node.load.is_finite() { node.load.clamp(0.0, 1.0) } else { 1.0 };
    let load = (1.0 - measured) * 100.0;

    let capacity = if node.total_slots > 0 {
        let free_after = node.free_slots().saturating_sub(demand.slots);
        f64::from(free_after) / f64::from(node.total_slots) * 100.0
    } else {
        0.0
    };

    let affinity = 100.0 / f64::from(hosted + 1);

    let score = weights.load * load + weights.capacity * capacity + weights.affinity * affinity;

    NodeScore {
        node_id: node.id.clone(),
        score,
        breakdown: ScoreBreakdown {
            load,
            capacity,
            affinity,
        },
    }
}

/// Score a single node, or say why it was rejected.
pub fn score_node(
    node: &NodeSnapshot,
    demand: &Demand,
    hosted: u32,
    weights: &ScoringWeights,
) -> Result<NodeScore, Rejection> {
    check_feasible(node, demand, hosted)?;
    Ok(fitness(node, demand, hosted, weights))
}

/// Score all feasible nodes and return them best first.
///
/// Ties are broken by lowest node ID so equal inputs always rank the same.
pub fn rank_nodes(
    nodes: &[NodeSnapshot],
    demand: &Demand,
    hosted: &HashMap<NodeId, u32>,
    weights: &ScoringWeights,
) -> Vec<NodeScore> {
    let mut scores: Vec<NodeScore> = nodes
        .iter()
        .filter_map(|n| {
            let count = hosted.get(&n.id).copied().unwrap_or(0);
            score_node(n, demand, count, weights).ok()
        })
        .collect();

    scores.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use provgrid_state::{Capability, Predicate};

    fn make_node(id: &str, load: f64, total: u32, used: u32) -> NodeSnapshot {
        NodeSnapshot {
            id: id.to_string(),
            capabilities: Default::default(),
            load,
            total_slots: total,
            used_slots: used,
            draining: false,
        }
    }

    fn demand() -> Demand {
        Demand {
            slots: 1,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_draining_node() {
        let mut node = make_node("n1", 0.1, 10, 0);
        node.draining = true;
        assert_eq!(check_feasible(&node, &demand(), 0), Err(Rejection::Draining));
    }

    #[test]
    fn rejects_insufficient_slots() {
        let node = make_node("n1", 0.1, 4, 4);
        assert_eq!(
            check_feasible(&node, &demand(), 0),
            Err(Rejection::Slots { free: 0, needed: 1 })
        );
    }

    #[test]
    fn rejects_missing_capability() {
        let node = make_node("n1", 0.1, 4, 0);
        let mut d = demand();
        d.requirements
            .push(Requirement::new("gpu", Predicate::Present));
        assert_eq!(
            check_feasible(&node, &d, 0),
            Err(Rejection::Requirement("gpu".to_string()))
        );
    }

    #[test]
    fn accepts_node_with_matching_capability() {
        let mut node = make_node("n1", 0.1, 4, 0);
        node.capabilities
            .insert("memory_gb".to_string(), Capability::Number(32.0));
        let mut d = demand();
        d.requirements
            .push(Requirement::new("memory_gb", Predicate::AtLeast(16.0)));
        assert!(check_feasible(&node, &d, 0).is_ok());
    }

    #[test]
    fn max_per_node_enforced() {
        let node = make_node("n1", 0.1, 10, 0);
        let mut d = demand();
        d.max_per_node = Some(2);
        assert!(check_feasible(&node, &d, 1).is_ok());
        assert_eq!(check_feasible(&node, &d, 2), Err(Rejection::MaxPerNode(2)));
    }

    #[test]
    fn lower_load_scores_higher() {
        let idle = make_node("n1", 0.2, 10, 0);
        let busy = make_node("n2", 0.8, 10, 0);
        let w = ScoringWeights::default();

        let s1 = score_node(&idle, &demand(), 0, &w).unwrap();
        let s2 = score_node(&busy, &demand(), 0, &w).unwrap();
        assert!(s1.score > s2.score, "{} <= {}", s1.score, s2.score);
    }

    #[test]
    fn hosting_same_element_lowers_score() {
        let node = make_node("n1", 0.5, 10, 0);
        let w = ScoringWeights {
            load: 0.0,
            capacity: 0.0,
            affinity: 1.0,
        };
        let fresh = fitness(&node, &demand(), 0, &w);
        let crowded = fitness(&node, &demand(), 3, &w);
        assert_eq!(fresh.score, 100.0);
        assert_eq!(crowded.score, 25.0);
    }

    #[test]
    fn rank_nodes_sorted_with_id_tie_break() {
        let nodes = vec![
            make_node("n3", 0.5, 10, 0),
            make_node("n1", 0.5, 10, 0),
            make_node("n2", 0.1, 10, 0),
        ];
        let ranked = rank_nodes(&nodes, &demand(), &HashMap::new(), &ScoringWeights::default());

        let order: Vec<&str> = ranked.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(order, vec!["n2", "n1", "n3"]);
    }

    #[test]
    fn capacity_component_reflects_headroom() {
        let roomy = make_node("n1", 0.5, 10, 0);
        let tight = make_node("n2", 0.5, 10, 8);
        let w = ScoringWeights {
            load: 0.0,
            capacity: 1.0,
            affinity: 0.0,
        };
        assert_eq!(fitness(&roomy, &demand(), 0, &w).breakdown.capacity, 90.0);
        assert_eq!(fitness(&tight, &demand(), 0, &w).breakdown.capacity, 10.0);
    }

    #[test]
    fn nan_load_never_outranks_a_measured_node() {
        let nodes = vec![
            make_node("a-nan", f64::NAN, 10, 0),
            make_node("b-busy", 0.9, 10, 0),
        ];
        let ranked = rank_nodes(&nodes, &demand(), &HashMap::new(), &ScoringWeights::default());

        assert_eq!(ranked[0].node_id, "b-busy");
        assert_eq!(ranked[1].breakdown.load, 0.0);
        assert!(ranked.iter().all(|s| s.score.is_finite()));
    }
}
