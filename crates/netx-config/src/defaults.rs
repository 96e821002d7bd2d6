//! Default value functions for serde deserialization.
//!
//! These functions forward to constants defined in `netx_core::defaults`.

use netx_core::defaults;

/// Generate default value functions that forward to netx_core::defaults constants.
macro_rules! default_fns {
    ($($fn_name:ident => $const_name:ident : $ty:ty),* $(,)?) => {
        $(
            pub(crate) fn $fn_name() -> $ty {
                defaults::$const_name
            }
        )*
    };
}

/// Generate default value functions that return String from &str constants.
macro_rules! default_string_fns {
    ($($fn_name:ident => $const_name:ident),* $(,)?) => {
        $(
            pub(crate) fn $fn_name() -> String {
                defaults::$const_name.to_string()
            }
        )*
    };
}

default_fns! {
    default_max_fails          => DEFAULT_MAX_FAILS: i64,
    default_fail_timeout_secs  => DEFAULT_FAIL_TIMEOUT_SECS: u64,
    default_router_retries     => DEFAULT_ROUTER_RETRIES: usize,
    default_dial_timeout_secs  => DEFAULT_DIAL_TIMEOUT_SECS: u64,
    default_rate_limit_requests => DEFAULT_RATE_LIMIT_REQUESTS: u32,
    default_sd_ttl_secs        => DEFAULT_TUNNEL_TTL_SECS: u64,
    default_shutdown_timeout_secs => DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64,
}

default_string_fns! {
    default_strategy => DEFAULT_STRATEGY,
}

pub(crate) fn default_handler_type() -> String {
    "relay".to_string()
}

pub(crate) fn default_listener_type() -> String {
    "tcp".to_string()
}

pub(crate) fn default_connector_type() -> String {
    "relay".to_string()
}

pub(crate) fn default_dialer_type() -> String {
    "tcp".to_string()
}

pub(crate) fn default_sd_type() -> String {
    "memory".to_string()
}
