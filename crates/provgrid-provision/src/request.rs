//! Provision requests and the retry policy applied to them.

use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use provgrid_state::{ElementId, InstanceId, NodeId};

/// Why an instance is being provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// Planned count increased or shortfall reconciled.
    New,
    /// Replacement for an instance that failed.
    Replacement { failed: InstanceId },
    /// Replace-then-retire move of a serving instance.
    Relocation {
        replaces: InstanceId,
        /// Current host, excluded from selection.
        from: Option<NodeId>,
    },
}

/// One unit of work for the dispatcher.
///
/// The instance ID is allocated by the tracker when the pending record
/// is created, so `(element, instance_id)` identifies the request.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub element: ElementId,
    pub instance_id: InstanceId,
    pub kind: RequestKind,
    /// Attempts already made.
    pub attempt: u32,
    pub last_failure: Option<String>,
    /// Backoff: not eligible before this instant.
    pub not_before: Option<Instant>,
}

impl ProvisionRequest {
    pub fn new(element: ElementId, instance_id: InstanceId, kind: RequestKind) -> Self {
        Self {
            element,
            instance_id,
            kind,
            attempt: 0,
            last_failure: None,
            not_before: None,
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|t| t <= now)
    }

    /// Host to keep this instance away from, if any.
    pub fn excluded_node(&self) -> Option<&NodeId> {
        match &self.kind {
            RequestKind::Relocation { from, .. } => from.as_ref(),
            _ => None,
        }
    }
}

/// Exponential backoff with a cap and an attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay after the failure of attempt number `attempt` (0-based):
    /// `base × 2^attempt`, capped at the maximum.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
