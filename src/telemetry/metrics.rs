//! Metric recording helpers.
//!
//! Metric names are stable; dashboards key off them.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

pub const REQUESTS_TOTAL: &str = "merge_requests_total";
pub const REQUESTS_MERGED_TOTAL: &str = "merge_requests_merged_total";
pub const DISPATCHES_TOTAL: &str = "merge_dispatches_total";
pub const CALL_FAILURES_TOTAL: &str = "merge_call_failures_total";
pub const CALL_LATENCY_MS: &str = "merge_call_latency_ms";
pub const QUEUE_DEPTH: &str = "merge_queue_depth";
pub const QUEUE_WAIT_MS: &str = "merge_queue_wait_ms";

/// Register metric descriptions with the installed recorder. Call once at
/// startup, after installing a recorder.
pub fn init_metrics() {
    describe_counter!(REQUESTS_TOTAL, "Requests received by the merge engine");
    describe_counter!(
        REQUESTS_MERGED_TOTAL,
        "Requests that attached to an existing in-flight call"
    );
    describe_counter!(DISPATCHES_TOTAL, "Underlying transport calls dispatched");
    describe_counter!(CALL_FAILURES_TOTAL, "Underlying transport calls that failed");
    describe_histogram!(CALL_LATENCY_MS, "Underlying call latency in milliseconds");
    describe_gauge!(QUEUE_DEPTH, "Requests parked behind the concurrency budget");
    describe_histogram!(QUEUE_WAIT_MS, "Time parked requests waited for budget, in milliseconds");
}

pub fn record_request() {
    counter!(REQUESTS_TOTAL).increment(1);
}

pub fn record_merged() {
    counter!(REQUESTS_MERGED_TOTAL).increment(1);
}

pub fn record_dispatch() {
    counter!(DISPATCHES_TOTAL).increment(1);
}

pub fn record_call(latency: Duration, ok: bool) {
    histogram!(CALL_LATENCY_MS).record(latency.as_secs_f64() * 1000.0);
    if !ok {
        counter!(CALL_FAILURES_TOTAL).increment(1);
    }
}

pub fn record_queue_depth(depth: usize) {
    gauge!(QUEUE_DEPTH).set(depth as f64);
}

pub fn record_queue_wait(waited: Duration) {
    histogram!(QUEUE_WAIT_MS).record(waited.as_secs_f64() * 1000.0);
}
