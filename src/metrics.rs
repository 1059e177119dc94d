// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = $value;
        $(let _ = $label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = $value;
        $(let _ = $label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = $value;
        $(let _ = $label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Registers descriptions for every metric the engine emits. Call once at startup.
pub fn describe_metrics() {
    describe_counter!("rpc_calls_total", "Chain JSON-RPC requests issued, by method.");
    describe_histogram!(
        "rpc_call_latency_seconds",
        "Latency of chain JSON-RPC requests, by method."
    );
    describe_counter!("rpc_errors_total", "Failed chain JSON-RPC requests, by method.");
    describe_counter!("cache_hits_total", "Cache lookups served from memory.");
    describe_counter!("cache_miss_total", "Cache lookups that required a fetch.");
    describe_counter!(
        "reconcile_passes_total",
        "Reconciliation passes, labelled by outcome."
    );
    describe_histogram!(
        "reconcile_duration_seconds",
        "Wall time of successful reconciliation passes."
    );
    describe_counter!(
        "reconcile_rows_total",
        "Rows written by reconciliation, labelled upsert/delete."
    );
    describe_gauge!("tracked_pools", "Pools in the current reconciled snapshot.");
    describe_gauge!(
        "active_subscriptions",
        "Live storage subscriptions held by the coordinator."
    );
}

pub fn increment_rpc_call(method: &str) {
    counter!("rpc_calls_total", 1, "method" => method.to_string());
}

pub fn increment_rpc_error(method: &str) {
    counter!("rpc_errors_total", 1, "method" => method.to_string());
}

pub fn record_rpc_call_latency(method: &str, duration: std::time::Duration) {
    histogram!("rpc_call_latency_seconds", duration.as_secs_f64(), "method" => method.to_string());
}

pub fn increment_cache_hit(cache_name: &str) {
    counter!("cache_hits_total", 1, "cache" => cache_name.to_string());
}

pub fn increment_cache_miss(cache_name: &str) {
    counter!("cache_miss_total", 1, "cache" => cache_name.to_string());
}

pub fn record_reconcile_pass(outcome: &'static str, duration: std::time::Duration) {
    counter!("reconcile_passes_total", 1, "outcome" => outcome);
    if outcome == "ok" {
        histogram!("reconcile_duration_seconds", duration.as_secs_f64());
    }
}

pub fn record_reconcile_rows(upserts: usize, deletes: usize) {
    counter!("reconcile_rows_total", upserts as u64, "kind" => "upsert");
    counter!("reconcile_rows_total", deletes as u64, "kind" => "delete");
}

pub fn set_pool_count(count: usize) {
    gauge!("tracked_pools", count as f64);
}

pub fn set_active_subscriptions(count: usize) {
    gauge!("active_subscriptions", count as f64);
}
