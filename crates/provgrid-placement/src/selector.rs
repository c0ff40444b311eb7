//! Provisioning selector: picks a node for one instance.
//!
//! Given a [`Demand`] and a registry snapshot, the selector:
//! 1. Filters nodes by hard requirements (scorer)
//! 2. Picks the best-ranked survivor, lowest node ID on ties
//! 3. Reports `NoCandidate` when nothing fits, which is a normal,
//!    retriable outcome
//!
//! Selection reserves nothing. The dispatcher re-validates the choice
//! against the latest snapshot before committing.

use std::collections::HashMap;

use tracing::debug;

use provgrid_state::{InstanceId, InstanceRecord, NodeId, NodeSnapshot};

use crate::scorer::{Demand, NodeScore, Rejection, ScoringWeights, check_feasible, fitness, rank_nodes};

/// Outcome of a selection.
#[derive(Debug, Clone)]
pub enum Selection {
    Node(NodeScore),
    NoCandidate { reason: String },
}

impl Selection {
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            Self::Node(s) => Some(&s.node_id),
            Self::NoCandidate { .. } => None,
        }
    }
}

/// Stateless, deterministic node selector.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    weights: ScoringWeights,
}

impl Selector {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Choose a node for one instance.
    ///
    /// `hosted` maps node ID → instances of the same element on it.
    pub fn select(
        &self,
        demand: &Demand,
        nodes: &[NodeSnapshot],
        hosted: &HashMap<NodeId, u32>,
    ) -> Selection {
        let ranked = rank_nodes(nodes, demand, hosted, &self.weights);
        match ranked.into_iter().next() {
            Some(best) => {
                debug!(
                    node = %best.node_id,
                    score = best.score,
                    load = best.breakdown.load,
                    capacity = best.breakdown.capacity,
                    affinity = best.breakdown.affinity,
                    "node selected"
                );
                Selection::Node(best)
            }
            None => Selection::NoCandidate {
                reason: summarize_rejections(nodes, demand, hosted),
            },
        }
    }

    /// Order serving instances for retirement, least useful first.
    ///
    /// Each instance is scored by how desirable its current host would be
    /// for it if it were placed now. Instances on hosts missing from the
    /// snapshot go first; ties retire the newest instance first.
    pub fn retirement_order(
        &self,
        demand: &Demand,
        candidates: &[InstanceRecord],
        nodes: &[NodeSnapshot],
        hosted: &HashMap<NodeId, u32>,
    ) -> Vec<InstanceId> {
        let mut scored: Vec<(f64, InstanceId)> = candidates
            .iter()
            .map(|r| {
                let node = r
                    .node_id
                    .as_ref()
                    .and_then(|id| nodes.iter().find(|n| &n.id == id));
                let usefulness = match node {
                    Some(n) => {
                        let others = hosted.get(&n.id).copied().unwrap_or(1).saturating_sub(1);
                        fitness(n, demand, others, &self.weights).score
                    }
                    None => f64::NEG_INFINITY,
                };
                (usefulness, r.instance_id)
            })
            .collect();

        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(&a.1)));
        scored.into_iter().map(|(_, id)| id).collect()
    }
}

fn summarize_rejections(
    nodes: &[NodeSnapshot],
    demand: &Demand,
    hosted: &HashMap<NodeId, u32>,
) -> String {
    if nodes.is_empty() {
        return "no compute nodes known".to_string();
    }
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    for node in nodes {
        let count = hosted.get(&node.id).copied().unwrap_or(0);
        if let Err(rejection) = check_feasible(node, demand, count) {
            let key = match rejection {
                Rejection::Draining => "draining",
                Rejection::Excluded => "excluded",
                Rejection::Requirement(_) => "requirements",
                Rejection::Slots { .. } => "slots",
                Rejection::MaxPerNode(_) => "max_per_node",
            };
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    let mut parts: Vec<String> = counts.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
    parts.sort();
    format!("no feasible node among {} ({})", nodes.len(), parts.join(", "))
}
