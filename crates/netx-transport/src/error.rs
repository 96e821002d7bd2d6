//! Error types for the transport crate.

use netx_chain::ChainError;
use netx_core::{ERROR_CONFIG, ERROR_HANDSHAKE, ERROR_IO};
use thiserror::Error;

/// Errors that can occur in transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("certificate generation failed: {0}")]
    CertGeneration(String),
}

impl TransportError {
    pub fn error_type(&self) -> &'static str {
        match self {
            TransportError::Io(_) => ERROR_IO,
            TransportError::Tls(_) => ERROR_HANDSHAKE,
            TransportError::Config(_) | TransportError::CertGeneration(_) => ERROR_CONFIG,
        }
    }
}

impl From<TransportError> for ChainError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(e) => ChainError::Io(e),
            other => ChainError::Handshake(other.to_string()),
        }
    }
}
