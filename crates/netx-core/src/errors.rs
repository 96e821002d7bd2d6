//! Error type constants for metrics and logging.
//!
//! These constants provide consistent error classification across all crates.

/// Protocol parsing/validation error.
pub const ERROR_PROTOCOL: &str = "protocol";
/// I/O error.
pub const ERROR_IO: &str = "io";
/// DNS/address resolution error.
pub const ERROR_RESOLVE: &str = "resolve";
/// Transport-level dial failure.
pub const ERROR_DIAL: &str = "dial";
/// Protocol-level negotiation failure with a node.
pub const ERROR_HANDSHAKE: &str = "handshake";
/// Timeout error.
pub const ERROR_TIMEOUT: &str = "timeout";
/// Authentication error.
pub const ERROR_AUTH: &str = "auth";
/// Administratively blocked (bypass hit, bind disabled).
pub const ERROR_FORBIDDEN: &str = "forbidden";
/// Rate or connection limit exceeded.
pub const ERROR_CAPACITY: &str = "capacity";
/// No live node or tunnel connector available.
pub const ERROR_UNAVAILABLE: &str = "unavailable";
/// Configuration error.
pub const ERROR_CONFIG: &str = "config";
