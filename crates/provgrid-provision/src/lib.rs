//! provgrid-provision: the provision queue and its dispatcher.
//!
//! Turns pending instance records into running instances. The queue
//! deduplicates and orders requests; the dispatcher selects a node,
//! instantiates through a [`Provisioner`], verifies liveness, and
//! confirms the record in the tracker.
//!
//! # Architecture
//!
//! ```text
//! submit(request) ──▶ ProvisionQueue (FIFO lane per element)
//!                          │ take_next()
//!                          ▼
//!                    Dispatcher workers ×N
//!                      ├── LeaderGate::write()   (standby → defer)
//!                      ├── Selector::select()    (no candidate → retry)
//!                      ├── NodeRegistry::reserve_slots()
//!                      ├── Provisioner::instantiate() + verify()
//!                      └── DeploymentTracker::confirm_active()
//! ```

pub mod dispatcher;
pub mod error;
pub mod provisioner;
pub mod queue;
pub mod request;

pub use dispatcher::{Dispatcher, Outcome};
pub use error::{ProvisionError, ProvisionResult};
pub use provisioner::{ProvisionFuture, Provisioner};
pub use queue::{ProvisionQueue, Submitted};
pub use request::{ProvisionRequest, RequestKind, RetryPolicy};
