//! provgridd: the provgrid orchestrator.
//!
//! Assembles the subsystems into one process:
//! - Deployment state tracker
//! - Compute node registry with dead-node reaping
//! - Leader gate
//! - Provision queue and dispatcher workers
//! - Watch monitor
//! - Scaling evaluator
//!
//! [`Orchestrator`] is the control surface; the `provgridd` binary wraps
//! it with a TOML configuration file and logging.

pub mod audit;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod provisioner;
pub mod telemetry;

pub use config::{DeploymentFile, OrchestratorConfig};
pub use error::{OrchestratorError, OrchestratorResult};
pub use orchestrator::{Collaborators, ElementStatus, Orchestrator, Status};
pub use provisioner::DryRunProvisioner;
