//! Rule engine seam.
//!
//! The evaluator only asks an engine which rules' triggers hold against
//! the current facts; debounce and dispatch stay in the evaluator. The
//! default [`PredicateEngine`] interprets [`Trigger`] trees directly.

use std::collections::HashMap;

use provgrid_state::{Direction, ElementId, InstanceId};
use provgrid_watch::MetricsStream;

use crate::rule::{Action, ScalingRule, Trigger};

/// What rules are evaluated against, for one element.
pub struct Facts<'a> {
    pub element: &'a ElementId,
    /// Current breach state per (watch, instance); cleared pairs absent.
    pub breaches: &'a HashMap<(String, InstanceId), Direction>,
    pub stream: &'a MetricsStream,
    /// Evaluation time (newest sample timestamp seen for the element).
    pub now: u64,
}

/// A rule whose trigger currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firing {
    pub rule: String,
    pub action: Action,
}

/// Decides which rules hold for a set of facts. Engines are shared with
/// the spawned evaluator task, so they must be `Send + Sync`.
pub trait RuleEngine: Send + Sync {
    fn evaluate(&self, rules: &[ScalingRule], facts: &Facts<'_>) -> Vec<Firing>;
}

/// Evaluates trigger predicates as declared.
#[derive(Debug, Default, Clone, Copy)]
pub struct PredicateEngine;

impl PredicateEngine {
    fn holds(trigger: &Trigger, facts: &Facts<'_>) -> bool {
        match trigger {
            Trigger::Breach { watch, direction } => facts
                .breaches
                .iter()
                .any(|((w, _), d)| w == watch && d == direction),
            Trigger::Above {
                watch,
                threshold,
                aggregate,
                window,
            } => facts
                .stream
                .aggregate(facts.element, watch, *aggregate, *window)
                .is_some_and(|v| v > *threshold),
            Trigger::Below {
                watch,
                threshold,
                aggregate,
                window,
            } => facts
                .stream
                .aggregate(facts.element, watch, *aggregate, *window)
                .is_some_and(|v| v < *threshold),
            Trigger::All { triggers } => triggers.iter().all(|t| Self::holds(t, facts)),
            Trigger::Any { triggers } => triggers.iter().any(|t| Self::holds(t, facts)),
        }
    }
}

impl RuleEngine for PredicateEngine {
    fn evaluate(&self, rules: &[ScalingRule], facts: &Facts<'_>) -> Vec<Firing> {
        rules
            .iter()
            .filter(|r| Self::holds(&r.trigger, facts))
            .map(|r| Firing {
                rule: r.name.clone(),
                action: r.action,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provgrid_state::WatchSample;
    use provgrid_watch::Aggregate;

    fn api() -> ElementId {
        ElementId::new("shop", "api")
    }

    fn rule(name: &str, trigger: Trigger) -> ScalingRule {
        ScalingRule {
            name: name.to_string(),
            trigger,
            action: Action::Increment(1),
            cooldown_ms: 0,
            sustain_ms: 0,
        }
    }

    fn stream_with(values: &[f64]) -> MetricsStream {
        let mut stream = MetricsStream::new(16);
        for (i, v) in values.iter().enumerate() {
            stream.append(WatchSample {
                element: api(),
                watch: "latency".to_string(),
                instance_id: 1,
                value: *v,
                timestamp: i as u64,
            });
        }
        stream
    }

    #[test]
    fn breach_trigger_matches_current_state() {
        let element = api();
        let stream = MetricsStream::new(4);
        let mut breaches = HashMap::new();
        breaches.insert(("cpu".to_string(), 2), Direction::BreachedHigh);
        let facts = Facts {
            element: &element,
            breaches: &breaches,
            stream: &stream,
            now: 0,
        };

        let rules = vec![
            rule(
                "up",
                Trigger::Breach {
                    watch: "cpu".to_string(),
                    direction: Direction::BreachedHigh,
                },
            ),
            rule(
                "down",
                Trigger::Breach {
                    watch: "cpu".to_string(),
                    direction: Direction::BreachedLow,
                },
            ),
        ];
        let fired = PredicateEngine.evaluate(&rules, &facts);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule, "up");
    }

    #[test]
    fn aggregate_triggers_and_composites() {
        let element = api();
        let stream = stream_with(&[100.0, 300.0, 500.0]);
        let breaches = HashMap::new();
        let facts = Facts {
            element: &element,
            breaches: &breaches,
            stream: &stream,
            now: 0,
        };

        let mean_above = Trigger::Above {
            watch: "latency".to_string(),
            threshold: 350.0,
            aggregate: Aggregate::Mean,
            window: 2,
        };
        let min_below = Trigger::Below {
            watch: "latency".to_string(),
            threshold: 200.0,
            aggregate: Aggregate::Min,
            window: 3,
        };
        let latest_below = Trigger::Below {
            watch: "latency".to_string(),
            threshold: 200.0,
            aggregate: Aggregate::Latest,
            window: 1,
        };

        let rules = vec![
            rule("mean", mean_above.clone()),
            rule("min", min_below.clone()),
            rule("latest", latest_below.clone()),
            rule("all", Trigger::All { triggers: vec![mean_above.clone(), latest_below] }),
            rule("any", Trigger::Any { triggers: vec![mean_above, min_below] }),
        ];
        let names: Vec<String> = PredicateEngine
            .evaluate(&rules, &facts)
            .into_iter()
            .map(|f| f.rule)
            .collect();
        assert_eq!(names, vec!["mean", "min", "any"]);
    }

    #[test]
    fn missing_samples_never_hold() {
        let element = api();
        let stream = MetricsStream::new(4);
        let breaches = HashMap::new();
        let facts = Facts {
            element: &element,
            breaches: &breaches,
            stream: &stream,
            now: 0,
        };
        let rules = vec![rule(
            "below",
            Trigger::Below {
                watch: "latency".to_string(),
                threshold: 1.0,
                aggregate: Aggregate::Latest,
                window: 1,
            },
        )];
        assert!(PredicateEngine.evaluate(&rules, &facts).is_empty());
    }
}
