//! Watch monitor error types.

use thiserror::Error;

pub type WatchResult<T> = Result<T, WatchError>;

#[derive(Debug, Error)]
pub enum WatchError {
    /// Sample for an element the monitor does not know about.
    #[error("no watches registered for element: {0}")]
    UnknownElement(String),

    #[error("invalid watch configuration: {0}")]
    Config(#[from] provgrid_state::StateError),
}
