//! Prometheus metrics for the JSON-RPC dispatcher and storage
//! backends.
//!
//! spec.md's Non-goals don't mention metrics at all — they bind
//! *features*, not ambient observability — so this crate carries a
//! metrics surface the same way its teacher does.
//!
//! Grounded on `ctld-agent/src/metrics.rs` almost verbatim in shape
//! (a `names` module of const strings, `init_metrics`, an
//! `OperationTimer` success()/failure() guard).

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names.
pub mod names {
    /// Counter: total JSON-RPC requests by method and outcome.
    pub const RPC_REQUESTS_TOTAL: &str = "targetd_rpc_requests_total";
    /// Histogram: JSON-RPC method dispatch duration in seconds.
    pub const RPC_DISPATCH_DURATION_SECONDS: &str = "targetd_rpc_dispatch_duration_seconds";
    /// Counter: authentication failures.
    pub const AUTH_FAILURES_TOTAL: &str = "targetd_auth_failures_total";
    /// Counter: requests rejected by the tarpit while an address was flagged.
    pub const TARPIT_LOCKOUTS_TOTAL: &str = "targetd_tarpit_lockouts_total";
    /// Gauge: number of configured block+fs pools.
    pub const POOLS_TOTAL: &str = "targetd_pools_total";
    /// Gauge: number of volumes across all block pools.
    pub const VOLUMES_TOTAL: &str = "targetd_volumes_total";
    /// Gauge: number of active iSCSI + NFS exports.
    pub const EXPORTS_TOTAL: &str = "targetd_exports_total";
}

/// Starts an HTTP listener on `addr` that serves Prometheus text
/// format at `/metrics`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Records one dispatched JSON-RPC method call.
pub fn record_rpc(method: &str, outcome: &str, duration_secs: f64) {
    counter!(names::RPC_REQUESTS_TOTAL, "method" => method.to_string(), "outcome" => outcome.to_string())
        .increment(1);
    histogram!(names::RPC_DISPATCH_DURATION_SECONDS, "method" => method.to_string()).record(duration_secs);
}

/// Records a failed HTTP Basic authentication attempt.
pub fn record_auth_failure() {
    counter!(names::AUTH_FAILURES_TOTAL).increment(1);
}

/// Records a request rejected by the tarpit because the client
/// address was already flagged.
pub fn record_tarpit_lockout() {
    counter!(names::TARPIT_LOCKOUTS_TOTAL).increment(1);
}

pub fn set_pools_count(count: usize) {
    gauge!(names::POOLS_TOTAL).set(count as f64);
}

pub fn set_volumes_count(count: usize) {
    gauge!(names::VOLUMES_TOTAL).set(count as f64);
}

pub fn set_exports_count(export_type: &str, count: usize) {
    gauge!(names::EXPORTS_TOTAL, "type" => export_type.to_string()).set(count as f64);
}

/// Helper for timing a dispatched RPC method.
pub struct DispatchTimer {
    method: String,
    start: Instant,
}

impl DispatchTimer {
    pub fn start(method: &str) -> Self {
        Self {
            method: method.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self, outcome: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_rpc(&self.method, outcome, duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_timer_does_not_panic() {
        let timer = DispatchTimer::start("pool_list");
        std::thread::sleep(std::time::Duration::from_millis(5));
        timer.finish("ok");
    }
}
