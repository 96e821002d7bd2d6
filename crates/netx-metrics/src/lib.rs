//! Metrics collection and Prometheus exporter for netx.
//!
//! Recording goes through the `metrics` facade, so every helper is a no-op
//! until an exporter is installed with [`init_prometheus`].

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus exporter on `listen` (`"127.0.0.1:9100"`).
pub fn init_prometheus(listen: &str) -> Result<(), String> {
    let addr: SocketAddr = listen
        .parse()
        .map_err(|e| format!("invalid metrics listen address: {e}"))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install prometheus exporter: {e}"))?;

    Ok(())
}

// ============================================================================
// Metric Names
// ============================================================================

/// Failed route establishments, by chain and first node.
pub const CHAIN_ERRORS_TOTAL: &str = "netx_chain_errors_total";
/// Time to dial and handshake the first node of a route (seconds).
pub const NODE_CONNECT_DURATION_SECONDS: &str = "netx_node_connect_duration_seconds";
/// Requests accepted by a service.
pub const SERVICE_REQUESTS_TOTAL: &str = "netx_service_requests_total";
/// Requests currently being handled by a service.
pub const SERVICE_REQUESTS_IN_FLIGHT: &str = "netx_service_requests_in_flight";
/// Request lifetime (seconds).
pub const SERVICE_REQUEST_DURATION_SECONDS: &str = "netx_service_request_duration_seconds";
/// Bytes moved by a service, by direction (`input` / `output`).
pub const SERVICE_TRANSFER_BYTES_TOTAL: &str = "netx_service_transfer_bytes_total";
/// Handler errors, by service and error type.
pub const SERVICE_HANDLER_ERRORS_TOTAL: &str = "netx_service_handler_errors_total";
/// Connections rejected before handling (rate limit, max connections).
pub const CONNECTIONS_REJECTED_TOTAL: &str = "netx_connections_rejected_total";
/// Live tunnel connectors held by this node.
pub const TUNNEL_CONNECTORS: &str = "netx_tunnel_connectors";
/// Tunnel dials served through service discovery.
pub const TUNNEL_SD_FALLBACK_TOTAL: &str = "netx_tunnel_sd_fallback_total";

// ============================================================================
// Metric Recording Functions
// ============================================================================

#[inline]
pub fn record_chain_error(chain: &str, node: &str) {
    counter!(CHAIN_ERRORS_TOTAL, "chain" => chain.to_owned(), "node" => node.to_owned())
        .increment(1);
}

#[inline]
pub fn record_node_connect_duration(chain: &str, node: &str, duration_secs: f64) {
    histogram!(NODE_CONNECT_DURATION_SECONDS, "chain" => chain.to_owned(), "node" => node.to_owned())
        .record(duration_secs);
}

/// Record a request entering a service.
#[inline]
pub fn record_request_started(service: &str) {
    counter!(SERVICE_REQUESTS_TOTAL, "service" => service.to_owned()).increment(1);
    gauge!(SERVICE_REQUESTS_IN_FLIGHT, "service" => service.to_owned()).increment(1.0);
}

/// Record a request leaving a service.
#[inline]
pub fn record_request_finished(service: &str, duration_secs: f64) {
    gauge!(SERVICE_REQUESTS_IN_FLIGHT, "service" => service.to_owned()).decrement(1.0);
    histogram!(SERVICE_REQUEST_DURATION_SECONDS, "service" => service.to_owned())
        .record(duration_secs);
}

/// Direction is `"input"` (client to target) or `"output"`.
#[inline]
pub fn record_transfer_bytes(service: &str, direction: &'static str, bytes: u64) {
    counter!(SERVICE_TRANSFER_BYTES_TOTAL, "service" => service.to_owned(), "direction" => direction)
        .increment(bytes);
}

#[inline]
pub fn record_handler_error(service: &str, error_type: &'static str) {
    counter!(SERVICE_HANDLER_ERRORS_TOTAL, "service" => service.to_owned(), "type" => error_type)
        .increment(1);
}

/// Reason is `"max_connections"` or `"rate_limit"`.
#[inline]
pub fn record_connection_rejected(reason: &'static str) {
    counter!(CONNECTIONS_REJECTED_TOTAL, "reason" => reason).increment(1);
}

#[inline]
pub fn set_tunnel_connectors(count: usize) {
    gauge!(TUNNEL_CONNECTORS).set(count as f64);
}

#[inline]
pub fn record_tunnel_sd_fallback() {
    counter!(TUNNEL_SD_FALLBACK_TOTAL).increment(1);
}

// ============================================================================
// Error Type Constants (re-exported from netx-core)
// ============================================================================

pub use netx_core::{
    ERROR_AUTH, ERROR_CAPACITY, ERROR_CONFIG, ERROR_DIAL, ERROR_FORBIDDEN, ERROR_HANDSHAKE,
    ERROR_IO, ERROR_PROTOCOL, ERROR_RESOLVE, ERROR_TIMEOUT, ERROR_UNAVAILABLE,
};
