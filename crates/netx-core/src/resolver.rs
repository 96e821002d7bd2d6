//! Name resolution contracts.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The host is not something this resolver handles; callers should use
    /// the address unchanged.
    #[error("resolver: invalid host")]
    Invalid,
    #[error("resolver: domain {0} does not exist")]
    NotFound(String),
    #[error("resolver: {0}")]
    Failed(String),
}

/// Resolves host names to addresses.
///
/// `network` carries an address family hint: a trailing `4` or `6`
/// (`"ip4"`, `"tcp6"`) restricts the result to that family.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, network: &str, host: &str) -> Result<Vec<IpAddr>, ResolveError>;
}

#[async_trait]
impl<R: Resolver + ?Sized> Resolver for Arc<R> {
    async fn resolve(&self, network: &str, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        (**self).resolve(network, host).await
    }
}

/// Static host table lookups consulted before DNS.
#[async_trait]
pub trait HostMapper: Send + Sync {
    /// Addresses mapped to `host`, or `None` when the table has no entry.
    async fn lookup(&self, network: &str, host: &str) -> Option<Vec<IpAddr>>;
}

#[async_trait]
impl<H: HostMapper + ?Sized> HostMapper for Arc<H> {
    async fn lookup(&self, network: &str, host: &str) -> Option<Vec<IpAddr>> {
        (**self).lookup(network, host).await
    }
}

/// Keep only addresses of the family named by `network`, if any.
pub fn filter_family(network: &str, ips: impl IntoIterator<Item = IpAddr>) -> Vec<IpAddr> {
    let want_v4 = network.ends_with('4');
    let want_v6 = network.ends_with('6');
    ips.into_iter()
        .filter(|ip| match ip {
            IpAddr::V4(_) => !want_v6,
            IpAddr::V6(_) => !want_v4,
        })
        .collect()
}
