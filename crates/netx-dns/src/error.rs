//! DNS resolver errors.

use netx_core::resolver::ResolveError;
use netx_core::{ERROR_CONFIG, ERROR_RESOLVE};

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    /// DNS lookup returned no results.
    #[error("dns lookup returned no results for {0}")]
    NoResults(String),

    #[error("dns lookup failed: {0}")]
    Lookup(#[from] hickory_resolver::ResolveError),

    /// Invalid DNS server URL.
    #[error("invalid dns server url: {0}")]
    InvalidServer(String),
}

impl DnsError {
    pub fn error_type(&self) -> &'static str {
        match self {
            DnsError::NoResults(_) | DnsError::Lookup(_) => ERROR_RESOLVE,
            DnsError::InvalidServer(_) => ERROR_CONFIG,
        }
    }
}

impl From<DnsError> for ResolveError {
    fn from(e: DnsError) -> Self {
        match e {
            DnsError::NoResults(host) => ResolveError::NotFound(host),
            other => ResolveError::Failed(other.to_string()),
        }
    }
}
