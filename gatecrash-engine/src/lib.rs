//! Scan engine: worker pool, orchestrator, and the result-sink contract.
//!
//! - [`pool`]: bounded worker fan-out with shared pacing, retry, and
//!   per-host halt
//! - [`orchestrator`]: URL × module loop, cross-module dedup, filters,
//!   resend
//! - [`sink`]: append-only [`sink::ResultSink`] contract plus the
//!   single-writer serializer
//! - [`metrics`] / [`throttle`]: counters and the adaptive global pacer

pub mod dedup;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod sink;
pub mod throttle;

pub use dedup::GlobalDedup;
pub use metrics::{MetricsSnapshot, ScanMetrics};
pub use orchestrator::{RunSummary, ScanInputs, Scanner};
pub use pool::{PoolConfig, RequestOutcome, RequestPool};
pub use sink::{spawn_serializer, Finding, ResultSink, SinkHandle};
pub use throttle::Pacer;
