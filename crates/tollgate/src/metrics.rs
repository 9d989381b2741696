//! Metrics (SPEC_FULL.md ambient stack, spec.md §1 "out of scope" for an
//! external exposition format but not for collection): pool hits/misses and
//! wait time, route dispatch outcomes, and backend liveness, collected with
//! the `prometheus` crate.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    Encoder, Histogram, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};

lazy_static! {
    pub static ref DISPATCH_TOTAL: IntCounterVec = register_int_counter_vec!(
        "tollgate_dispatch_total",
        "Requests dispatched, by tenant and outcome (matched, fallback, not_found, method_not_allowed)",
        &["tenant", "outcome"]
    )
    .unwrap();
    /// The interpreter pool is one process-wide pool shared by every tenant
    /// (spec.md §4.1), so these carry no per-tenant label.
    pub static ref SCRIPT_POOL_HITS: IntGauge = register_int_gauge!(
        "tollgate_script_pool_hits_total",
        "Interpreter pool checkouts served from a free slot"
    )
    .unwrap();
    pub static ref SCRIPT_POOL_MISSES: IntGauge = register_int_gauge!(
        "tollgate_script_pool_misses_total",
        "Interpreter pool checkouts that had to wait or burst-grow"
    )
    .unwrap();
    pub static ref SCRIPT_POOL_WAIT_SECONDS: Histogram = register_histogram!(
        "tollgate_script_pool_wait_seconds",
        "Time spent waiting for an interpreter slot"
    )
    .unwrap();
    pub static ref BACKEND_ALIVE: IntGaugeVec = register_int_gauge_vec!(
        "tollgate_backend_alive",
        "1 if the backend's last health probe succeeded, else 0",
        &["tenant", "backend"]
    )
    .unwrap();
}

/// Renders the default registry in Prometheus text exposition format. Not
/// served here (spec.md §1 out-of-scope admin surface); an external
/// collaborator mounts this behind `/metrics`.
pub fn render() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .expect("prometheus text encoding is infallible for well-formed metrics");
    String::from_utf8(buffer).expect("prometheus text encoder emits valid utf-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_counter_increments() {
        DISPATCH_TOTAL.with_label_values(&["acme", "matched"]).inc();
        let rendered = render();
        assert!(rendered.contains("tollgate_dispatch_total"));
    }

    #[test]
    fn backend_alive_gauge_is_settable() {
        BACKEND_ALIVE.with_label_values(&["acme", "svc-a"]).set(1);
        BACKEND_ALIVE.with_label_values(&["acme", "svc-b"]).set(0);
        let rendered = render();
        assert!(rendered.contains("tollgate_backend_alive"));
    }
}
