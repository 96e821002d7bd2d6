//! Server error types.

use netx_chain::ChainError;
use netx_config::ConfigError;
use netx_dns::DnsError;
use netx_metrics::{ERROR_CONFIG, ERROR_IO};
use netx_relay::RelayError;
use netx_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("build: {0}")]
    Build(String),
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
    #[error("unknown {kind} type: {name}")]
    UnknownType { kind: &'static str, name: String },
    #[error("chain: {0}")]
    Chain(#[from] ChainError),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("relay: {0}")]
    Relay(#[from] RelayError),
    #[error("dns: {0}")]
    Dns(#[from] DnsError),
}

impl ServerError {
    /// Get the error type string for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            ServerError::Io(_) => ERROR_IO,
            ServerError::Config(_)
            | ServerError::Build(_)
            | ServerError::NotFound { .. }
            | ServerError::UnknownType { .. } => ERROR_CONFIG,
            ServerError::Chain(e) => e.error_type(),
            ServerError::Transport(e) => e.error_type(),
            ServerError::Relay(e) => e.error_type(),
            ServerError::Dns(e) => e.error_type(),
        }
    }
}
