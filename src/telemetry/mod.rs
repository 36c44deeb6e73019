//! Telemetry for the merge engine.
//!
//! Structured logging via `tracing` and a `metrics` facade for counters,
//! gauges and latency histograms. The host application chooses subscribers
//! and exporters; without them everything here is a no-op.

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    init_metrics, record_call, record_dispatch, record_merged, record_queue_depth,
    record_queue_wait, record_request,
};
