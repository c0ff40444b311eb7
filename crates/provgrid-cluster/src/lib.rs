//! provgrid-cluster: compute node registry and the single-writer gate.
//!
//! # Architecture
//!
//! ```text
//! Capability feed ──push/poll──▶ NodeRegistry ──Arc<ClusterSnapshot>──▶ Selector
//!                                    │
//!                                    └── reap_dead() ──▶ orchestrator fails hosted instances
//!
//! LeaderGate
//!   ├── Leader  → write() grants a WriteGuard for the current term
//!   └── Standby → write() returns NotLeader; reads continue
//! ```

pub mod error;
pub mod leader;
pub mod registry;

pub use error::{ClusterError, ClusterResult};
pub use leader::{LeaderGate, Role, WriteGuard};
pub use registry::{
    CapabilityFeed, ClusterSnapshot, FeedFuture, Member, MemberStatus, NodeRegistry, run_refresh,
};
