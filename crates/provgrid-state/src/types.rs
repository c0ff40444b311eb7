//! Domain types for the provgrid deployment model.
//!
//! These types describe what operators deploy (operational strings and
//! their service elements), what the orchestrator tracks at runtime
//! (instance records), and the metric samples and threshold events that
//! flow through the autoscaling loop. All types are serde-serializable so
//! they can be loaded from deployment files and written to audit sinks.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Unique identifier for a compute node.
pub type NodeId = String;

/// Instance identifier, unique within a service element and never reused.
pub type InstanceId = u64;

// ── Identity ───────────────────────────────────────────────────────

/// Identity of a service element: operational-string name + service name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId {
    pub opstring: String,
    pub name: String,
}

impl ElementId {
    pub fn new(opstring: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            opstring: opstring.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.opstring, self.name)
    }
}

// ── Deployment descriptors ─────────────────────────────────────────

/// A named deployment unit grouping one or more service elements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationalString {
    pub name: String,
    /// Free-form version label, compared by `update`.
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub elements: Vec<ServiceElement>,
}

/// A declared service type: identity, planned count, requirements, SLAs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceElement {
    pub name: String,
    /// Desired ("planned") instance count.
    pub planned: u32,
    /// Floor and ceiling for the planned count.
    pub bounds: InstanceBounds,
    /// Hard capability requirements a node must satisfy.
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    /// Slots consumed on a node per instance.
    #[serde(default = "default_slots")]
    pub slots: u32,
    /// Maximum instances of this element on a single node.
    #[serde(default)]
    pub max_per_node: Option<u32>,
    /// SLA declarations (watch + thresholds).
    #[serde(default)]
    pub slas: Vec<SlaSpec>,
    /// Per-instance configuration parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

fn default_slots() -> u32 {
    1
}

/// Floor/ceiling for an element's planned instance count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceBounds {
    pub min: u32,
    pub max: u32,
}

impl InstanceBounds {
    /// Clamp a requested count into `[min, max]`.
    pub fn clamp(&self, count: i64) -> u32 {
        count.clamp(i64::from(self.min), i64::from(self.max)) as u32
    }
}

/// SLA declaration: a watch with low/high thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlaSpec {
    /// Watch (metric stream) name, e.g. "cpu" or "latency".
    pub watch: String,
    pub low: f64,
    pub high: f64,
    /// Distance a value must travel back past a threshold to clear it.
    #[serde(default)]
    pub clear_margin: f64,
    /// Sampling cadence for the watch timer in milliseconds.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Name of the scaling rule this SLA drives, if any. The rule itself
    /// is declared alongside the deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

fn default_sample_interval_ms() -> u64 {
    5_000
}

impl SlaSpec {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

// ── Capabilities and requirements ──────────────────────────────────

/// A capability value advertised by a compute node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Capability {
    Flag(bool),
    Number(f64),
    Text(String),
}

/// Predicate a named capability must satisfy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Predicate {
    /// Capability present (and, for flags, true).
    Present,
    /// Numeric capability >= value.
    AtLeast(f64),
    /// Numeric capability <= value.
    AtMost(f64),
    /// Text capability equal to value.
    Equals(String),
}

/// A hard requirement: named capability + predicate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Requirement {
    pub capability: String,
    pub predicate: Predicate,
}

impl Requirement {
    pub fn new(capability: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            capability: capability.into(),
            predicate,
        }
    }

    /// Evaluate this requirement against a node's advertised capabilities.
    pub fn is_satisfied_by(&self, capabilities: &BTreeMap<String, Capability>) -> bool {
        let Some(value) = capabilities.get(&self.capability) else {
            return false;
        };
        match (&self.predicate, value) {
            (Predicate::Present, Capability::Flag(b)) => *b,
            (Predicate::Present, _) => true,
            (Predicate::AtLeast(min), Capability::Number(v)) => v >= min,
            (Predicate::AtMost(max), Capability::Number(v)) => v <= max,
            (Predicate::Equals(want), Capability::Text(v)) => v == want,
            _ => false,
        }
    }
}

// ── Compute nodes ──────────────────────────────────────────────────

/// Point-in-time view of a compute node's capabilities and load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeSnapshot {
    pub id: NodeId,
    #[serde(default)]
    pub capabilities: BTreeMap<String, Capability>,
    /// Measured load, 0.0 (idle) ..= 1.0 (saturated).
    #[serde(default)]
    pub load: f64,
    /// Total instance slots the node offers.
    pub total_slots: u32,
    /// Slots currently consumed.
    #[serde(default)]
    pub used_slots: u32,
    /// Draining nodes are visible but accept no new placements.
    #[serde(default)]
    pub draining: bool,
}

impl NodeSnapshot {
    pub fn free_slots(&self) -> u32 {
        self.total_slots.saturating_sub(self.used_slots)
    }
}

// ── Instances ──────────────────────────────────────────────────────

/// Per-instance configuration derived from a service element.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceConfig {
    pub element: ElementId,
    pub instance_id: InstanceId,
    pub parameters: BTreeMap<String, String>,
}

impl InstanceConfig {
    pub fn new(opstring: &str, element: &ServiceElement, instance_id: InstanceId) -> Self {
        let mut parameters = element.parameters.clone();
        parameters.insert("instance.id".to_string(), instance_id.to_string());
        Self {
            element: ElementId::new(opstring, &element.name),
            instance_id,
            parameters,
        }
    }
}

/// Lifecycle state of an instance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Active,
    /// Still running, a replacement is being provisioned.
    Relocating,
    Failed,
    Terminated,
}

impl InstanceState {
    /// Whether the instance is running and serving.
    pub fn is_serving(self) -> bool {
        matches!(self, Self::Active | Self::Relocating)
    }

    /// Whether the record counts against the planned count.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Pending | Self::Active | Self::Relocating)
    }
}

/// Runtime record of a single instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub element: ElementId,
    pub instance_id: InstanceId,
    pub node_id: Option<NodeId>,
    pub state: InstanceState,
    /// Instance this one replaces (relocation in progress).
    pub replaces: Option<InstanceId>,
    /// Unix timestamp (ms) of the last state change.
    pub updated_at: u64,
}

// ── Watches and thresholds ─────────────────────────────────────────

/// A single timestamped metric sample (a "calculable").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchSample {
    pub element: ElementId,
    pub watch: String,
    pub instance_id: InstanceId,
    pub value: f64,
    /// Sample time in Unix milliseconds.
    pub timestamp: u64,
}

/// Direction of a threshold transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    BreachedHigh,
    BreachedLow,
    Cleared,
}

/// Emitted when a (watch, instance) pair changes threshold state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdEvent {
    pub element: ElementId,
    pub watch: String,
    pub instance_id: InstanceId,
    pub direction: Direction,
    pub value: f64,
    pub timestamp: u64,
}

// ── Validation ─────────────────────────────────────────────────────

impl SlaSpec {
    pub fn validate(&self, element: &str) -> StateResult<()> {
        if self.watch.is_empty() {
            return Err(invalid(element, "sla watch name is empty"));
        }
        if !self.low.is_finite() || !self.high.is_finite() || !self.clear_margin.is_finite() {
            return Err(invalid(element, format!("watch {}: thresholds must be finite", self.watch)));
        }
        if self.low >= self.high {
            return Err(invalid(
                element,
                format!("watch {}: low {} is not below high {}", self.watch, self.low, self.high),
            ));
        }
        if self.clear_margin < 0.0 {
            return Err(invalid(element, format!("watch {}: negative clear margin", self.watch)));
        }
        if self.sample_interval_ms == 0 {
            return Err(invalid(element, format!("watch {}: zero sample interval", self.watch)));
        }
        Ok(())
    }
}

impl ServiceElement {
    /// Reject malformed declarations before they reach the queue.
    pub fn validate(&self) -> StateResult<()> {
        if self.name.is_empty() {
            return Err(StateError::InvalidConfig("service element name is empty".to_string()));
        }
        if self.bounds.min > self.bounds.max {
            return Err(invalid(
                &self.name,
                format!("floor {} exceeds ceiling {}", self.bounds.min, self.bounds.max),
            ));
        }
        if self.planned < self.bounds.min || self.planned > self.bounds.max {
            return Err(invalid(
                &self.name,
                format!(
                    "planned {} outside [{}, {}]",
                    self.planned, self.bounds.min, self.bounds.max
                ),
            ));
        }
        if self.max_per_node == Some(0) {
            return Err(invalid(&self.name, "max_per_node must be at least 1"));
        }
        let mut watches = HashMap::new();
        for sla in &self.slas {
            sla.validate(&self.name)?;
            if watches.insert(sla.watch.as_str(), ()).is_some() {
                return Err(invalid(&self.name, format!("duplicate watch {}", sla.watch)));
            }
        }
        Ok(())
    }

    pub fn sla(&self, watch: &str) -> Option<&SlaSpec> {
        self.slas.iter().find(|s| s.watch == watch)
    }
}

impl OperationalString {
    pub fn validate(&self) -> StateResult<()> {
        if self.name.is_empty() {
            return Err(StateError::InvalidConfig("operational string name is empty".to_string()));
        }
        let mut names = HashMap::new();
        for element in &self.elements {
            element.validate()?;
            if names.insert(element.name.as_str(), ()).is_some() {
                return Err(invalid(&element.name, "duplicate service element name"));
            }
        }
        Ok(())
    }

    pub fn element_ids(&self) -> Vec<ElementId> {
        self.elements
            .iter()
            .map(|e| ElementId::new(&self.name, &e.name))
            .collect()
    }
}

fn invalid(element: &str, msg: impl fmt::Display) -> StateError {
    StateError::InvalidConfig(format!("{element}: {msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(planned: u32, min: u32, max: u32) -> ServiceElement {
        ServiceElement {
            name: "api".to_string(),
            planned,
            bounds: InstanceBounds { min, max },
            requirements: Vec::new(),
            slots: 1,
            max_per_node: None,
            slas: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }

    fn sla(low: f64, high: f64) -> SlaSpec {
        SlaSpec {
            watch: "cpu".to_string(),
            low,
            high,
            clear_margin: 0.05,
            sample_interval_ms: 1000,
            rule: None,
        }
    }

    #[test]
    fn bounds_clamp() {
        let b = InstanceBounds { min: 1, max: 5 };
        assert_eq!(b.clamp(-3), 1);
        assert_eq!(b.clamp(3), 3);
        assert_eq!(b.clamp(9), 5);
    }

    #[test]
    fn floor_above_ceiling_rejected() {
        let err = element(2, 5, 1).validate().unwrap_err();
        assert!(matches!(err, StateError::InvalidConfig(_)));
    }

    #[test]
    fn planned_outside_bounds_rejected() {
        assert!(element(6, 1, 5).validate().is_err());
        assert!(element(0, 1, 5).validate().is_err());
        assert!(element(2, 1, 5).validate().is_ok());
    }

    #[test]
    fn contradictory_thresholds_rejected() {
        let mut e = element(2, 1, 5);
        e.slas.push(sla(0.9, 0.2));
        assert!(e.validate().is_err());

        e.slas[0] = sla(0.2, 0.9);
        assert!(e.validate().is_ok());
    }

    #[test]
    fn duplicate_watches_rejected() {
        let mut e = element(2, 1, 5);
        e.slas.push(sla(0.2, 0.8));
        e.slas.push(sla(0.1, 0.7));
        assert!(e.validate().is_err());
    }

    #[test]
    fn duplicate_element_names_rejected() {
        let opstring = OperationalString {
            name: "shop".to_string(),
            version: "1".to_string(),
            elements: vec![element(1, 1, 2), element(1, 1, 2)],
        };
        assert!(opstring.validate().is_err());
    }

    #[test]
    fn requirement_predicates() {
        let mut caps = BTreeMap::new();
        caps.insert("memory_gb".to_string(), Capability::Number(16.0));
        caps.insert("gpu".to_string(), Capability::Flag(true));
        caps.insert("ssd".to_string(), Capability::Flag(false));
        caps.insert("arch".to_string(), Capability::Text("x86_64".to_string()));

        assert!(Requirement::new("memory_gb", Predicate::AtLeast(8.0)).is_satisfied_by(&caps));
        assert!(!Requirement::new("memory_gb", Predicate::AtLeast(32.0)).is_satisfied_by(&caps));
        assert!(Requirement::new("memory_gb", Predicate::AtMost(16.0)).is_satisfied_by(&caps));
        assert!(Requirement::new("gpu", Predicate::Present).is_satisfied_by(&caps));
        assert!(!Requirement::new("ssd", Predicate::Present).is_satisfied_by(&caps));
        assert!(!Requirement::new("fpga", Predicate::Present).is_satisfied_by(&caps));
        assert!(Requirement::new("arch", Predicate::Equals("x86_64".into())).is_satisfied_by(&caps));
        // Type mismatch never satisfies.
        assert!(!Requirement::new("arch", Predicate::AtLeast(1.0)).is_satisfied_by(&caps));
    }

    #[test]
    fn instance_config_carries_id() {
        let e = element(1, 1, 2);
        let cfg = InstanceConfig::new("shop", &e, 7);
        assert_eq!(cfg.element, ElementId::new("shop", "api"));
        assert_eq!(cfg.parameters.get("instance.id"), Some(&"7".to_string()));
    }

    #[test]
    fn element_id_display() {
        assert_eq!(ElementId::new("shop", "api").to_string(), "shop/api");
    }

    #[test]
    fn states_classify() {
        assert!(InstanceState::Relocating.is_serving());
        assert!(!InstanceState::Pending.is_serving());
        assert!(InstanceState::Pending.is_live());
        assert!(!InstanceState::Failed.is_live());
    }
}
