//! provgrid-state: deployment model and state tracking for provgrid.
//!
//! Holds the data model shared by every other crate (operational strings,
//! service elements, instance records, watch samples, threshold events),
//! the [`DeploymentTracker`] that owns all instance state, and the
//! reporting sink used for asynchronous outcomes.
//!
//! # Architecture
//!
//! The tracker is an explicitly constructed value (`Clone` + `Send` +
//! `Sync`, backed by `Arc<RwLock<..>>`) owned by the orchestrator and
//! passed by reference to the dispatcher and scaling loop. Every state
//! transition is one atomic operation; readers take a
//! [`TrackerSnapshot`].

pub mod error;
pub mod report;
pub mod tracker;
pub mod types;

pub use error::{StateError, StateResult};
pub use report::{MemorySink, Report, ReportSink, SharedSink, TracingSink};
pub use tracker::{
    Confirmation, DeploymentTracker, ElementView, PlannedChange, TrackerSnapshot, UpdatePlan,
    epoch_millis,
};
pub use types::*;
