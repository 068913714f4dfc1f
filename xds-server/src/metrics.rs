//! Metric recording for the discovery server.
//!
//! Emitted through the `metrics` facade; whether anything is collected
//! depends on the recorder the embedding process installs.

use metrics::{counter, gauge, histogram};

pub(crate) fn inc_internal_errors() {
    counter!("xds_internal_errors_total").increment(1);
}

pub(crate) fn inc_expired_nonce() {
    counter!("xds_expired_nonce_total").increment(1);
}

pub(crate) fn inc_write_timeouts() {
    counter!("xds_write_timeout_total").increment(1);
}

pub(crate) fn inc_push_errors() {
    counter!("xds_push_errors_total").increment(1);
}

/// A client rejected a pushed config (NACK), by short type and code name.
pub(crate) fn inc_rejects(type_url: &str, code: tonic::Code) {
    counter!(
        "xds_rejects_total",
        "type" => crate::resource::short_type(type_url).to_string(),
        "code" => format!("{code:?}"),
    )
    .increment(1);
}

/// Track the live client gauge, labeled by proxy version.
pub(crate) fn record_clients(proxy_version: &str, delta: f64) {
    gauge!("xds_clients", "version" => proxy_version.to_string()).increment(delta);
}

pub(crate) fn record_pushed_services(count: usize) {
    gauge!("xds_pushed_services").set(count as f64);
}

/// Time from push trigger to the per-connection push completing.
pub(crate) fn record_convergence(seconds: f64) {
    histogram!("xds_push_convergence_seconds").record(seconds);
}
