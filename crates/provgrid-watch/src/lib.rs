//! provgrid-watch: SLA watches, threshold hysteresis, and sample history.
//!
//! # Architecture
//!
//! ```text
//! WatchMonitor
//!   ├── ingest(sample)                 push path
//!   ├── Per-(element, watch, instance) timer polling a MetricSource
//!   ├── ThresholdTracker per key (Normal ⇄ BreachedHigh / BreachedLow)
//!   └── WatchSignal channel ──▶ scaling evaluator
//!                             └──▶ ReportSink (threshold events)
//! MetricsStream
//!   └── bounded per-watch history with replay and aggregates
//! ```
//!
//! Events are emitted only on transitions, and clearing a breach needs
//! the value to travel back past the threshold by the SLA's margin.

pub mod error;
pub mod monitor;
pub mod stream;
pub mod threshold;

pub use error::{WatchError, WatchResult};
pub use monitor::{MetricFuture, MetricSource, SignalReceiver, SignalSender, WatchMonitor, WatchSignal};
pub use stream::{Aggregate, MetricsStream};
pub use threshold::{ThresholdState, ThresholdTracker};
