//! Routing errors.

use netx_core::resolver::ResolveError;
use netx_core::{
    ERROR_CONFIG, ERROR_DIAL, ERROR_FORBIDDEN, ERROR_HANDSHAKE, ERROR_IO, ERROR_PROTOCOL, ERROR_RESOLVE,
    ERROR_TIMEOUT, ERROR_UNAVAILABLE,
};

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("resolve: {0}")]
    Resolve(#[from] ResolveError),
    #[error("dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("{0} is not supported")]
    Unsupported(&'static str),
    #[error("node unavailable")]
    NodeUnavailable,
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),
    #[error("load nodes: {0}")]
    Load(String),
}

impl ChainError {
    pub fn dial(addr: impl Into<String>, source: std::io::Error) -> Self {
        ChainError::Dial {
            addr: addr.into(),
            source,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ChainError::Resolve(_) => ERROR_RESOLVE,
            ChainError::Dial { .. } => ERROR_DIAL,
            ChainError::Io(_) => ERROR_IO,
            ChainError::Handshake(_) => ERROR_HANDSHAKE,
            ChainError::Forbidden(_) | ChainError::Unsupported(_) => ERROR_FORBIDDEN,
            ChainError::NodeUnavailable => ERROR_UNAVAILABLE,
            ChainError::Protocol(_) => ERROR_PROTOCOL,
            ChainError::Timeout(_) => ERROR_TIMEOUT,
            ChainError::Load(_) => ERROR_CONFIG,
        }
    }
}
