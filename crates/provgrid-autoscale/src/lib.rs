//! provgrid-autoscale: rule-driven changes to planned instance counts.
//!
//! Watch signals (raw samples and threshold events) flow into one
//! [`ScalingEvaluator`] loop. Per element it keeps the current breach
//! state of every (watch, instance) pair plus recent sample history, asks
//! a [`RuleEngine`] which rules hold, debounces the answers and hands the
//! surviving [`ScaleDirective`]s to a callback.
//!
//! ```text
//! WatchSignal ──▶ ScalingEvaluator ──▶ RuleEngine::evaluate
//!                       │
//!                   debounce (cooldown, sustain, latch)
//!                       │
//!                       ▼
//!                 ScaleCallback(ScaleDirective)
//! ```
//!
//! The callback owns clamping to the element's bounds and the resulting
//! provisioning or retirement; the evaluator never touches deployment
//! state.

pub mod engine;
pub mod error;
pub mod evaluator;
pub mod rule;

pub use engine::{Facts, Firing, PredicateEngine, RuleEngine};
pub use error::{RuleError, RuleResult};
pub use evaluator::{
    EvaluatorCommand, EvaluatorHandle, ScaleCallback, ScaleDirective, ScaleFuture, ScalingEvaluator,
};
pub use rule::{Action, ScalingRule, Trigger, validate_rules};
