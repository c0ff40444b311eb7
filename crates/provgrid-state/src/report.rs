//! Reporting sink for asynchronous outcomes.
//!
//! Steady-state failures (abandoned requests, invariant violations) and
//! autoscaling activity are never thrown back to a caller; they are
//! published as structured [`Report`] records instead.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::types::{ElementId, InstanceId, NodeId, ThresholdEvent};

/// A structured record published to the reporting sink.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Report {
    Provisioned {
        element: ElementId,
        instance_id: InstanceId,
        node: NodeId,
    },
    /// Retry budget exhausted; the element stays under-satisfied.
    Abandoned {
        element: ElementId,
        instance_id: InstanceId,
        attempts: u32,
        reason: String,
        shortfall: u32,
    },
    Threshold(ThresholdEvent),
    Scaled {
        element: ElementId,
        rule: String,
        from: u32,
        to: u32,
        /// Count the rule asked for before clamping.
        requested: i64,
    },
    Retired {
        element: ElementId,
        instance_id: InstanceId,
        node: Option<NodeId>,
        reason: String,
    },
    Failed {
        element: ElementId,
        instance_id: InstanceId,
        reason: String,
    },
    InvariantViolation {
        element: ElementId,
        detail: String,
    },
}

/// Destination for report records.
pub trait ReportSink: Send + Sync {
    fn report(&self, record: Report);
}

/// Shared handle to a sink.
pub type SharedSink = Arc<dyn ReportSink>;

/// Sink that logs every record through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn report(&self, record: Report) {
        match &record {
            Report::Abandoned {
                element,
                instance_id,
                attempts,
                reason,
                shortfall,
            } => warn!(
                %element,
                instance = instance_id,
                attempts,
                shortfall,
                %reason,
                "provision request abandoned"
            ),
            Report::InvariantViolation { element, detail } => {
                error!(%element, %detail, "invariant violation, element paused")
            }
            Report::Failed {
                element,
                instance_id,
                reason,
            } => warn!(%element, instance = instance_id, %reason, "instance failed"),
            Report::Threshold(ev) => info!(
                element = %ev.element,
                watch = %ev.watch,
                instance = ev.instance_id,
                direction = ?ev.direction,
                value = ev.value,
                "threshold event"
            ),
            other => info!(record = ?other, "report"),
        }
    }
}

/// Sink that keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Report>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Copy of all records seen so far.
    pub fn records(&self) -> Vec<Report> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records matching a predicate.
    pub fn matching(&self, f: impl Fn(&Report) -> bool) -> Vec<Report> {
        self.records().into_iter().filter(|r| f(r)).collect()
    }
}

impl ReportSink for MemorySink {
    fn report(&self, record: Report) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_collects() {
        let sink = MemorySink::new();
        sink.report(Report::InvariantViolation {
            element: ElementId::new("a", "b"),
            detail: "x".to_string(),
        });
        sink.report(Report::Failed {
            element: ElementId::new("a", "b"),
            instance_id: 3,
            reason: "lease expired".to_string(),
        });

        assert_eq!(sink.records().len(), 2);
        let failed = sink.matching(|r| matches!(r, Report::Failed { .. }));
        assert_eq!(failed.len(), 1);
    }

    #[test]
    fn report_serializes_with_kind_tag() {
        let r = Report::Scaled {
            element: ElementId::new("shop", "api"),
            rule: "scale-up".to_string(),
            from: 2,
            to: 3,
            requested: 3,
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["kind"], "scaled");
        assert_eq!(json["to"], 3);
    }
}
