//! Scaling rule declarations.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use provgrid_state::Direction;
use provgrid_watch::Aggregate;

use crate::error::{RuleError, RuleResult};

/// What a rule does to the planned count when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "by", rename_all = "snake_case")]
pub enum Action {
    Increment(u32),
    Decrement(u32),
}

impl Action {
    /// Signed change to the planned count.
    pub fn delta(&self) -> i64 {
        match *self {
            Self::Increment(n) => i64::from(n),
            Self::Decrement(n) => -i64::from(n),
        }
    }
}

fn default_window() -> usize {
    1
}

/// Predicate over an element's watch state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Some instance is currently in the given breach state on `watch`.
    Breach { watch: String, direction: Direction },
    /// Aggregate of the newest `window` samples is above `threshold`.
    Above {
        watch: String,
        threshold: f64,
        #[serde(default)]
        aggregate: Aggregate,
        #[serde(default = "default_window")]
        window: usize,
    },
    /// Aggregate of the newest `window` samples is below `threshold`.
    Below {
        watch: String,
        threshold: f64,
        #[serde(default)]
        aggregate: Aggregate,
        #[serde(default = "default_window")]
        window: usize,
    },
    All { triggers: Vec<Trigger> },
    Any { triggers: Vec<Trigger> },
}

impl Trigger {
    fn validate(&self, rule: &str) -> RuleResult<()> {
        let invalid = |reason: &str| RuleError::Invalid {
            rule: rule.to_string(),
            reason: reason.to_string(),
        };
        match self {
            Self::Breach { watch, direction } => {
                if watch.is_empty() {
                    return Err(invalid("watch name is empty"));
                }
                if *direction == Direction::Cleared {
                    return Err(invalid("breach trigger needs breached_high or breached_low"));
                }
            }
            Self::Above {
                watch,
                threshold,
                window,
                ..
            }
            | Self::Below {
                watch,
                threshold,
                window,
                ..
            } => {
                if watch.is_empty() {
                    return Err(invalid("watch name is empty"));
                }
                if !threshold.is_finite() {
                    return Err(invalid("threshold must be finite"));
                }
                if *window == 0 {
                    return Err(invalid("window must be at least 1"));
                }
            }
            Self::All { triggers } | Self::Any { triggers } => {
                if triggers.is_empty() {
                    return Err(invalid("composite trigger is empty"));
                }
                for t in triggers {
                    t.validate(rule)?;
                }
            }
        }
        Ok(())
    }
}

/// A named trigger → action pair with debounce settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingRule {
    pub name: String,
    pub trigger: Trigger,
    pub action: Action,
    /// Minimum time between two firings of this rule.
    #[serde(default)]
    pub cooldown_ms: u64,
    /// How long the trigger must hold before the rule may fire.
    #[serde(default)]
    pub sustain_ms: u64,
}

impl ScalingRule {
    pub fn validate(&self) -> RuleResult<()> {
        if self.name.is_empty() {
            return Err(RuleError::Invalid {
                rule: "<unnamed>".to_string(),
                reason: "rule name is empty".to_string(),
            });
        }
        if matches!(self.action, Action::Increment(0) | Action::Decrement(0)) {
            return Err(RuleError::Invalid {
                rule: self.name.clone(),
                reason: "action amount must be positive".to_string(),
            });
        }
        self.trigger.validate(&self.name)
    }
}

/// Validate a rule set for one element.
pub fn validate_rules(rules: &[ScalingRule]) -> RuleResult<()> {
    let mut names = HashSet::new();
    for rule in rules {
        rule.validate()?;
        if !names.insert(rule.name.as_str()) {
            return Err(RuleError::DuplicateName(rule.name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scale_up() -> ScalingRule {
        ScalingRule {
            name: "scale-up".to_string(),
            trigger: Trigger::Breach {
                watch: "cpu".to_string(),
                direction: Direction::BreachedHigh,
            },
            action: Action::Increment(1),
            cooldown_ms: 60_000,
            sustain_ms: 0,
        }
    }

    #[test]
    fn action_delta() {
        assert_eq!(Action::Increment(2).delta(), 2);
        assert_eq!(Action::Decrement(3).delta(), -3);
    }

    #[test]
    fn rejects_zero_action_and_cleared_trigger() {
        let mut rule = scale_up();
        rule.action = Action::Increment(0);
        assert!(rule.validate().is_err());

        let mut rule = scale_up();
        rule.trigger = Trigger::Breach {
            watch: "cpu".to_string(),
            direction: Direction::Cleared,
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn rejects_empty_composite_and_zero_window() {
        let mut rule = scale_up();
        rule.trigger = Trigger::Any { triggers: vec![] };
        assert!(rule.validate().is_err());

        rule.trigger = Trigger::Above {
            watch: "cpu".to_string(),
            threshold: 0.9,
            aggregate: Aggregate::Mean,
            window: 0,
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = validate_rules(&[scale_up(), scale_up()]).unwrap_err();
        assert!(matches!(err, RuleError::DuplicateName(_)));
    }

    #[test]
    fn rule_from_toml() {
        let rule: ScalingRule = toml::from_str(
            r#"
            name = "scale-down"
            cooldown_ms = 30000
            action = { kind = "decrement", by = 1 }
            trigger = { kind = "below", watch = "cpu", threshold = 0.2, aggregate = "mean", window = 5 }
            "#,
        )
        .unwrap();
        assert_eq!(rule.action, Action::Decrement(1));
        assert!(matches!(rule.trigger, Trigger::Below { window: 5, aggregate: Aggregate::Mean, .. }));
        assert_eq!(rule.sustain_ms, 0);
    }
}
