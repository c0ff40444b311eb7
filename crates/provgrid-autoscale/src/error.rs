//! Rule loading errors.

use thiserror::Error;

pub type RuleResult<T> = Result<T, RuleError>;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid rule {rule}: {reason}")]
    Invalid { rule: String, reason: String },

    #[error("duplicate rule name: {0}")]
    DuplicateName(String),

    /// The evaluator loop is gone.
    #[error("scaling evaluator stopped")]
    Closed,
}
