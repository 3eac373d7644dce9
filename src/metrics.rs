//! Metrics Sink (§4.G): a passive collaborator. Every other module calls
//! into the free functions here; nothing reads back. Backed by the
//! `metrics` facade with a Prometheus exporter, matching the teacher's
//! choice of crates for its own (pre-existing) metrics surface.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::errors::DispatchError;
use crate::models::Tier;
use crate::scheduler::RoundStats;

/// Starts the Prometheus HTTP exporter on `0.0.0.0:{port}`. Call once at
/// startup before any of the recording functions below are used.
pub fn install(port: u16) -> Result<(), DispatchError> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| DispatchError::Fatal(format!("failed to install metrics exporter: {e}")))
}

// ---- API: ingest-facing counters --------------------------------------

pub fn record_event_ingested(tier: Tier) {
    counter!("dispatch_events_ingested_total", "tier" => tier.as_str()).increment(1);
}

pub fn record_event_rejected(reason: &'static str) {
    counter!("dispatch_events_rejected_total", "reason" => reason).increment(1);
}

// ---- Processing: scheduler and worker pool -----------------------------

pub fn record_round(stats: &RoundStats) {
    gauge!("dispatch_scheduler_backlog").set(stats.backlog as f64);
    gauge!("dispatch_scheduler_throttled").set(if stats.throttled { 1.0 } else { 0.0 });
    counter!("dispatch_scheduler_emergency_scheduled_total").increment(stats.emergency_scheduled as u64);
    for (tier, count) in &stats.scheduled_per_tier {
        counter!("dispatch_scheduler_scheduled_total", "tier" => tier.as_str()).increment(*count as u64);
    }
    for tier in &stats.rate_limited_tiers {
        counter!("dispatch_scheduler_rate_limited_total", "tier" => tier.as_str()).increment(1);
    }
}

pub fn record_session_processed(tier: Tier, success: bool, duration_ms: u64) {
    counter!("dispatch_sessions_processed_total", "tier" => tier.as_str(), "success" => success.to_string()).increment(1);
    histogram!("dispatch_session_duration_ms", "tier" => tier.as_str()).record(duration_ms as f64);
}

pub fn record_event_finding(success: bool, risk_score: f64) {
    counter!("dispatch_events_processed_total", "success" => success.to_string()).increment(1);
    histogram!("dispatch_event_risk_score").record(risk_score);
}

// ---- Storage: Candidate Store -------------------------------------------

pub fn record_store_size(total: usize) {
    gauge!("dispatch_store_candidates").set(total as f64);
}

pub fn record_store_eviction(home_id: &str) {
    counter!("dispatch_store_evictions_total", "home_id" => home_id.to_string()).increment(1);
}

// ---- Business: per-tier token buckets -----------------------------------

pub fn record_tokens_available(tier: Tier, tokens: f64) {
    gauge!("dispatch_token_bucket_available", "tier" => tier.as_str()).set(tokens);
}

pub fn record_queue_depth(queue: &'static str, depth: i64) {
    gauge!("dispatch_queue_depth", "queue" => queue).set(depth as f64);
}

// ---- System: process-level gauges ---------------------------------------

pub fn record_system_snapshot(sys: &sysinfo::System) {
    gauge!("dispatch_system_cpu_percent").set(sys.global_cpu_usage() as f64);
    gauge!("dispatch_system_memory_used_bytes").set(sys.used_memory() as f64);
}
