//! Daemon configuration (`provgridd.toml`) and deployment files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use provgrid_autoscale::ScalingRule;
use provgrid_placement::ScoringWeights;
use provgrid_provision::RetryPolicy;
use provgrid_state::{NodeSnapshot, OperationalString};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub replica_id: String,
    /// Start holding the ownership token.
    pub leader: bool,
    /// Dispatcher worker count.
    pub workers: usize,
    pub retry: RetryPolicy,
    pub weights: ScoringWeights,
    pub registry: RegistryConfig,
    pub stream: StreamConfig,
    /// Static compute nodes, kept alive by the daemon itself.
    pub nodes: Vec<NodeSnapshot>,
    /// JSON-lines file receiving every report record.
    pub audit_log: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            replica_id: "provgrid-0".to_string(),
            leader: true,
            workers: 4,
            retry: RetryPolicy::default(),
            weights: ScoringWeights::default(),
            registry: RegistryConfig::default(),
            stream: StreamConfig::default(),
            nodes: Vec::new(),
            audit_log: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub dead_timeout_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            dead_timeout_secs: 30,
            reap_interval_secs: 5,
        }
    }
}

impl RegistryConfig {
    pub fn dead_timeout(&self) -> Duration {
        Duration::from_secs(self.dead_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Samples kept per (element, watch).
    pub capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

impl OrchestratorConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: OrchestratorConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!(
                "retry.base_delay_ms {} exceeds retry.max_delay_ms {}",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }
        let w = &self.weights;
        if [w.load, w.capacity, w.affinity]
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            bail!("scoring weights must be finite and non-negative");
        }
        if w.load + w.capacity + w.affinity == 0.0 {
            bail!("at least one scoring weight must be positive");
        }
        if self.stream.capacity == 0 {
            bail!("stream.capacity must be at least 1");
        }
        for node in &self.nodes {
            if node.id.is_empty() {
                bail!("static node with empty id");
            }
        }
        Ok(())
    }
}

/// A deployment file: one operational string plus scaling rules keyed by
/// service element name.
///
/// ```toml
/// [opstring]
/// name = "shop"
/// version = "1"
///
/// [[opstring.elements]]
/// name = "api"
/// planned = 2
/// bounds = { min = 1, max = 5 }
///
/// [[rules.api]]
/// name = "scale-up"
/// cooldown_ms = 60000
/// action = { kind = "increment", by = 1 }
/// trigger = { kind = "breach", watch = "cpu", direction = "breached_high" }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentFile {
    pub opstring: OperationalString,
    #[serde(default)]
    pub rules: BTreeMap<String, Vec<ScalingRule>>,
}

impl DeploymentFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading deployment {}", path.display()))?;
        let file: DeploymentFile = toml::from_str(&content)
            .with_context(|| format!("parsing deployment {}", path.display()))?;
        for element in file.rules.keys() {
            if !file.opstring.elements.iter().any(|e| &e.name == element) {
                bail!(
                    "rules reference unknown element {element} in {}",
                    file.opstring.name
                );
            }
        }
        for element in &file.opstring.elements {
            for sla in &element.slas {
                let Some(rule) = &sla.rule else { continue };
                let declared = file
                    .rules
                    .get(&element.name)
                    .is_some_and(|rules| rules.iter().any(|r| &r.name == rule));
                if !declared {
                    bail!(
                        "sla {} of {} references undeclared rule {rule}",
                        sla.watch,
                        element.name
                    );
                }
            }
        }
        Ok(file)
    }
}
