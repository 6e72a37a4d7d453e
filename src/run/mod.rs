//! Experiment run execution: state machine, registry, worker pool, aggregation.

pub mod aggregator;
pub mod controller;
pub mod job;
pub mod pool;
pub mod registry;
pub mod state;

pub use aggregator::MetricStats;
pub use controller::{CancelOutcome, RunController, RunHandle, RunResults};
pub use state::{RunStatus, RunStatusView};
