//! Placement decisions for provgrid: where a new instance should run, and
//! which instance should go first when scaling down.
//!
//! # Components
//!
//! - **`scorer`**: feasibility checks and weighted node scoring
//! - **`selector`**: deterministic node choice and retirement ordering
//! - **`convert`**: building a [`Demand`] from a service element

pub mod convert;
pub mod scorer;
pub mod selector;

pub use convert::{element_to_demand, relocation_demand};
pub use scorer::{
    Demand, NodeScore, Rejection, ScoreBreakdown, ScoringWeights, check_feasible, fitness,
    rank_nodes, score_node,
};
pub use selector::{Selection, Selector};
