//! Metrics collection and exposition.
//!
//! # Metrics
//! - `pixelgate_rate_limited_total{scope}` (counter): denied requests by limiting scope
//! - `pixelgate_rate_limit_entries` (gauge): live rate-limit counters
//! - `pixelgate_quota_checks_total{tier,allowed}` (counter): quota decisions
//! - `pixelgate_signed_url_validations_total{outcome}` (counter): validation outcomes
//! - `pixelgate_retry_attempts_total{service}` (counter): attempts made through the retry service
//! - `pixelgate_hook_executions_total{hook,outcome}` (counter): extension hook runs
//! - `pixelgate_api_errors_total{type,severity}` (counter): normalised API errors
//!
//! All recorders go through the `metrics` facade and cost nothing when no
//! exporter is installed.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_rate_limited(scope: &'static str) {
    counter!("pixelgate_rate_limited_total", "scope" => scope).increment(1);
}

pub fn record_rate_limit_entries(entries: usize) {
    gauge!("pixelgate_rate_limit_entries").set(entries as f64);
}

pub fn record_quota_check(tier: &'static str, allowed: bool) {
    let allowed = if allowed { "true" } else { "false" };
    counter!("pixelgate_quota_checks_total", "tier" => tier, "allowed" => allowed).increment(1);
}

pub fn record_signed_url_validation(outcome: &'static str) {
    counter!("pixelgate_signed_url_validations_total", "outcome" => outcome).increment(1);
}

pub fn record_retry_attempt(service: &str) {
    counter!("pixelgate_retry_attempts_total", "service" => service.to_string()).increment(1);
}

pub fn record_hook_execution(hook: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(
        "pixelgate_hook_executions_total",
        "hook" => hook.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_api_error(error_type: &'static str, severity: &'static str) {
    counter!("pixelgate_api_errors_total", "type" => error_type, "severity" => severity)
        .increment(1);
}
