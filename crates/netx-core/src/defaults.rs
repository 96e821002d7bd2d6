//! Default configuration values.
//!
//! Centralized default constants for use across all crates.

// ============================================================================
// Selector Defaults
// ============================================================================

/// Default number of failures before a node is considered dead.
pub const DEFAULT_MAX_FAILS: i64 = 1;
/// Default time a dead node stays excluded from selection, in seconds.
pub const DEFAULT_FAIL_TIMEOUT_SECS: u64 = 10;
/// Default selector strategy name.
pub const DEFAULT_STRATEGY: &str = "round";

// ============================================================================
// Router Defaults
// ============================================================================

/// Default number of extra route attempts made by the router.
pub const DEFAULT_ROUTER_RETRIES: usize = 0;
/// Default per-attempt dial timeout in seconds (0 = no timeout).
pub const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 15;

// ============================================================================
// Relay Defaults
// ============================================================================

/// Default UDP relay buffer size.
pub const DEFAULT_UDP_BUFFER_SIZE: usize = 4096;
/// Smallest UDP relay buffer accepted from metadata.
pub const MIN_UDP_BUFFER_SIZE: usize = 512;
/// Largest UDP relay buffer accepted from metadata.
pub const MAX_UDP_BUFFER_SIZE: usize = 64 * 1024;
/// Default stats push period for handler observers, in seconds.
pub const DEFAULT_OBSERVE_PERIOD_SECS: u64 = 5;
/// Default bidirectional copy buffer size.
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 32 * 1024;

// ============================================================================
// Tunnel Defaults
// ============================================================================

/// Default lifetime of a tunnel connector lease, in seconds.
pub const DEFAULT_TUNNEL_TTL_SECS: u64 = 15;
/// Number of pool entries the tunnel dialer tries before falling back to SD.
pub const DEFAULT_TUNNEL_DIAL_RETRIES: usize = 3;
/// Timeout for cross-node tunnel dials, in seconds.
pub const DEFAULT_TUNNEL_DIAL_TIMEOUT_SECS: u64 = 15;
/// Maximum bytes buffered while sniffing the HTTP host on an entrypoint.
pub const DEFAULT_ENTRYPOINT_MAX_HEADER_BYTES: usize = 8192;

// ============================================================================
// UDP Listener Defaults
// ============================================================================

/// Default idle lifetime of a per-peer UDP connection, in seconds.
pub const DEFAULT_UDP_CONN_TTL_SECS: u64 = 5;
/// Default per-peer receive queue length.
pub const DEFAULT_UDP_QUEUE_SIZE: usize = 128;
/// Default accept backlog of a UDP listener.
pub const DEFAULT_UDP_BACKLOG: usize = 128;

// ============================================================================
// Service Defaults
// ============================================================================

/// Backoff applied after a transient accept failure, in milliseconds.
pub const DEFAULT_ACCEPT_BACKOFF_MS: u64 = 1000;
/// Default TCP listener backlog.
pub const DEFAULT_CONNECTION_BACKLOG: u32 = 1024;
/// Default graceful shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
/// Default TCP_NODELAY for outbound dials.
pub const DEFAULT_TCP_NO_DELAY: bool = true;
/// Default TLS handshake timeout for `tls` service listeners, in seconds.
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Rate Limit Defaults
// ============================================================================

/// Default requests allowed per key within one window.
pub const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 100;
/// Default rate limit window in seconds.
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 1;
/// Default rate limit cleanup interval in seconds.
pub const DEFAULT_RATE_LIMIT_CLEANUP_SECS: u64 = 300;

// ============================================================================
// Loader Defaults
// ============================================================================

/// Default timeout for HTTP node loaders, in seconds.
pub const DEFAULT_HTTP_LOADER_TIMEOUT_SECS: u64 = 30;
