//! Error types for the relay crate.

use std::time::Duration;

use netx_chain::ChainError;
use netx_core::{
    ERROR_AUTH, ERROR_CAPACITY, ERROR_CONFIG, ERROR_FORBIDDEN, ERROR_IO, ERROR_PROTOCOL,
    ERROR_TIMEOUT, ERROR_UNAVAILABLE,
};
use netx_proto::{ProtoError, Status};
use thiserror::Error;

/// Errors that can occur in relay and tunnel handling.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Proto(#[from] ProtoError),

    #[error("relay: bad version {0}")]
    BadVersion(u8),

    #[error("relay: unknown command {0}")]
    UnknownCommand(u8),

    #[error("relay: unauthorized")]
    Unauthorized,

    #[error("relay: rate limiting exceeded")]
    RateLimited,

    #[error("relay: forbidden: {0}")]
    Forbidden(String),

    #[error("relay: no route to host {0}")]
    NoRoute(String),

    #[error("relay: tunnel not available")]
    TunnelNotAvailable,

    #[error("relay: bad request: {0}")]
    BadRequest(String),

    /// The peer answered with a non-OK status.
    #[error("relay: peer replied {0}")]
    Rejected(Status),

    #[error("relay: read timeout after {0:?}")]
    Timeout(Duration),

    #[error("mux: {0}")]
    Mux(String),

    #[error("route: {0}")]
    Chain(#[from] ChainError),

    #[error("config error: {0}")]
    Config(String),
}

impl RelayError {
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayError::Io(_) | RelayError::Mux(_) => ERROR_IO,
            RelayError::Proto(e) => e.error_type(),
            RelayError::BadVersion(_)
            | RelayError::UnknownCommand(_)
            | RelayError::BadRequest(_)
            | RelayError::Rejected(_) => ERROR_PROTOCOL,
            RelayError::Unauthorized => ERROR_AUTH,
            RelayError::RateLimited => ERROR_CAPACITY,
            RelayError::Forbidden(_) | RelayError::NoRoute(_) => ERROR_FORBIDDEN,
            RelayError::TunnelNotAvailable => ERROR_UNAVAILABLE,
            RelayError::Timeout(_) => ERROR_TIMEOUT,
            RelayError::Chain(e) => e.error_type(),
            RelayError::Config(_) => ERROR_CONFIG,
        }
    }
}

impl From<RelayError> for ChainError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Io(e) => ChainError::Io(e),
            RelayError::Chain(e) => e,
            RelayError::Rejected(s @ (Status::Forbidden | Status::Unauthorized)) => {
                ChainError::Forbidden(s.to_string())
            }
            RelayError::Unauthorized => ChainError::Forbidden("unauthorized".into()),
            RelayError::Forbidden(s) => ChainError::Forbidden(s),
            RelayError::Timeout(d) => ChainError::Timeout(d),
            other => ChainError::Protocol(other.to_string()),
        }
    }
}
