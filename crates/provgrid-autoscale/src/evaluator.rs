//! Scaling evaluator: the single consumer of watch signals.
//!
//! Every sample and threshold event for an element is applied in arrival
//! order, then the element's rules are evaluated once against the updated
//! facts. Firings pass through per-rule debounce before they become
//! [`ScaleDirective`]s handed to the scale callback.
//!
//! Debounce, per (element, rule), on sample time:
//! - a rule whose trigger became true fires once, provided its cooldown
//!   has elapsed since its previous firing;
//! - while the trigger stays true it is latched and fires again only
//!   after `cooldown_ms` (never, if the cooldown is zero);
//! - `sustain_ms` delays the first firing until the trigger has held
//!   that long;
//! - the latch resets when the trigger goes false.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use provgrid_state::{Direction, ElementId, InstanceId};
use provgrid_watch::{MetricsStream, SignalReceiver, WatchSignal};

use crate::engine::{Facts, PredicateEngine, RuleEngine};
use crate::error::{RuleError, RuleResult};
use crate::rule::{Action, ScalingRule, validate_rules};

/// A debounced rule firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleDirective {
    pub element: ElementId,
    pub rule: String,
    pub action: Action,
    /// Sample time at which the rule fired.
    pub timestamp: u64,
}

/// Future returned by a [`ScaleCallback`].
pub type ScaleFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Callback that applies a directive (planned-count change plus the
/// matching provisioning or retirement).
pub type ScaleCallback = Arc<dyn Fn(ScaleDirective) -> ScaleFuture + Send + Sync>;

/// Control messages for a running evaluator.
#[derive(Debug, Clone)]
pub enum EvaluatorCommand {
    /// Replace the rule set of an element.
    LoadRules {
        element: ElementId,
        rules: Vec<ScalingRule>,
    },
    /// Drop rules, debounce state and history of an element.
    Forget(ElementId),
    /// An instance left; its breach state and samples no longer count.
    InstanceRetired {
        element: ElementId,
        instance_id: InstanceId,
    },
}

/// Sending side of the evaluator's command channel.
#[derive(Debug, Clone)]
pub struct EvaluatorHandle {
    tx: mpsc::UnboundedSender<EvaluatorCommand>,
}

impl EvaluatorHandle {
    /// Create a handle and the receiver to pass to [`ScalingEvaluator::run`].
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EvaluatorCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Validate and install a rule set. Invalid rules are rejected here,
    /// before the evaluator sees them.
    pub fn load_rules(&self, element: &ElementId, rules: Vec<ScalingRule>) -> RuleResult<()> {
        validate_rules(&rules)?;
        self.send(EvaluatorCommand::LoadRules {
            element: element.clone(),
            rules,
        })
    }

    pub fn forget(&self, element: &ElementId) -> RuleResult<()> {
        self.send(EvaluatorCommand::Forget(element.clone()))
    }

    pub fn instance_retired(&self, element: &ElementId, instance_id: InstanceId) -> RuleResult<()> {
        self.send(EvaluatorCommand::InstanceRetired {
            element: element.clone(),
            instance_id,
        })
    }

    fn send(&self, command: EvaluatorCommand) -> RuleResult<()> {
        self.tx.send(command).map_err(|_| RuleError::Closed)
    }
}

/// Debounce state for one (element, rule).
#[derive(Debug, Default, Clone, Copy)]
struct Debounce {
    last_fired: Option<u64>,
    /// Sample time at which the trigger most recently became true.
    true_since: Option<u64>,
    /// Fired during the current true period.
    latched: bool,
}

impl Debounce {
    /// Advance with the trigger's current truth value; returns whether
    /// the rule fires now.
    fn step(&mut self, holds: bool, now: u64, rule: &ScalingRule) -> bool {
        if !holds {
            self.true_since = None;
            self.latched = false;
            return false;
        }
        let since = *self.true_since.get_or_insert(now);
        if now.saturating_sub(since) < rule.sustain_ms {
            return false;
        }
        let cooled = self
            .last_fired
            .is_none_or(|last| now.saturating_sub(last) >= rule.cooldown_ms);
        let fire = if self.latched {
            rule.cooldown_ms > 0 && cooled
        } else {
            cooled
        };
        if fire {
            self.last_fired = Some(now);
            self.latched = true;
        }
        fire
    }
}

#[derive(Default)]
struct ElementState {
    rules: Vec<ScalingRule>,
    debounce: HashMap<String, Debounce>,
    breaches: HashMap<(String, InstanceId), Direction>,
    /// Newest sample time seen for the element.
    clock: u64,
}

/// Single-consumer rule evaluation loop.
pub struct ScalingEvaluator {
    engine: Box<dyn RuleEngine>,
    elements: HashMap<ElementId, ElementState>,
    stream: MetricsStream,
    scale_fn: Option<ScaleCallback>,
}

impl ScalingEvaluator {
    pub fn new(stream_capacity: usize) -> Self {
        Self {
            engine: Box::new(PredicateEngine),
            elements: HashMap::new(),
            stream: MetricsStream::new(stream_capacity),
            scale_fn: None,
        }
    }

    /// Swap the rule engine.
    pub fn with_engine(mut self, engine: Box<dyn RuleEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Set the callback used to apply directives.
    pub fn with_scale_fn(mut self, f: ScaleCallback) -> Self {
        self.scale_fn = Some(f);
        self
    }

    pub fn stream(&self) -> &MetricsStream {
        &self.stream
    }

    pub fn apply_command(&mut self, command: EvaluatorCommand) {
        match command {
            EvaluatorCommand::LoadRules { element, rules } => {
                info!(element = %element, rules = rules.len(), "scaling rules loaded");
                let state = self.elements.entry(element).or_default();
                state.debounce.retain(|name, _| rules.iter().any(|r| &r.name == name));
                state.rules = rules;
            }
            EvaluatorCommand::Forget(element) => {
                self.elements.remove(&element);
                self.stream.forget(&element);
                debug!(element = %element, "scaling state dropped");
            }
            EvaluatorCommand::InstanceRetired {
                element,
                instance_id,
            } => {
                if let Some(state) = self.elements.get_mut(&element) {
                    state.breaches.retain(|(_, id), _| *id != instance_id);
                }
                self.stream.forget_instance(&element, instance_id);
            }
        }
    }

    /// Apply one signal and return the directives it produced.
    pub fn handle_signal(&mut self, signal: WatchSignal) -> Vec<ScaleDirective> {
        let element = match &signal {
            WatchSignal::Sample(s) => s.element.clone(),
            WatchSignal::Threshold(e) => e.element.clone(),
        };
        // Unknown elements still get history so rules loaded later can
        // look back at it.
        let state = self.elements.entry(element.clone()).or_default();
        match signal {
            WatchSignal::Sample(sample) => {
                state.clock = state.clock.max(sample.timestamp);
                self.stream.append(sample);
            }
            WatchSignal::Threshold(event) => {
                state.clock = state.clock.max(event.timestamp);
                let key = (event.watch, event.instance_id);
                match event.direction {
                    Direction::Cleared => {
                        state.breaches.remove(&key);
                    }
                    direction => {
                        state.breaches.insert(key, direction);
                    }
                }
            }
        }

        if state.rules.is_empty() {
            return Vec::new();
        }

        let now = state.clock;
        let facts = Facts {
            element: &element,
            breaches: &state.breaches,
            stream: &self.stream,
            now,
        };
        let firing = self.engine.evaluate(&state.rules, &facts);

        let mut directives = Vec::new();
        for rule in &state.rules {
            let holds = firing.iter().any(|f| f.rule == rule.name);
            let debounce = state.debounce.entry(rule.name.clone()).or_default();
            let was_latched = debounce.latched;
            if debounce.step(holds, now, rule) {
                info!(
                    element = %element,
                    rule = %rule.name,
                    action = ?rule.action,
                    at = now,
                    "scaling rule fired"
                );
                directives.push(ScaleDirective {
                    element: element.clone(),
                    rule: rule.name.clone(),
                    action: rule.action,
                    timestamp: now,
                });
            } else if holds && !was_latched {
                debug!(
                    element = %element,
                    rule = %rule.name,
                    at = now,
                    "scaling rule suppressed by cooldown or sustain"
                );
            }
        }
        directives
    }

    /// Run until shutdown or until the signal channel closes.
    pub async fn run(
        mut self,
        mut signals: SignalReceiver,
        mut commands: mpsc::UnboundedReceiver<EvaluatorCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("scaling evaluator started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("scaling evaluator shutting down");
                    break;
                }
                Some(command) = commands.recv() => self.apply_command(command),
                signal = signals.recv() => {
                    let Some(signal) = signal else {
                        info!("signal channel closed, scaling evaluator exiting");
                        break;
                    };
                    for directive in self.handle_signal(signal) {
                        self.dispatch(directive).await;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, directive: ScaleDirective) {
        let Some(scale_fn) = self.scale_fn.clone() else {
            return;
        };
        let element = directive.element.clone();
        let rule = directive.rule.clone();
        if let Err(e) = scale_fn(directive).await {
            warn!(element = %element, rule = %rule, error = %e, "scaling action failed");
        }
    }
}
