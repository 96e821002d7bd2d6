use std::sync::Arc;

use netx_core::net::{join_host_port, split_host_port};
use netx_core::resolver::{HostMapper, ResolveError, Resolver};
use tracing::{debug, warn};

use crate::error::ChainError;

/// Rewrite the host of `addr` to an IP: the host table wins, then the
/// resolver. Addresses without a host, or hosts the resolver reports as
/// invalid, pass through unchanged.
pub async fn resolve(
    network: &str,
    addr: &str,
    resolver: Option<&Arc<dyn Resolver>>,
    hosts: Option<&Arc<dyn HostMapper>>,
) -> Result<String, ChainError> {
    let Ok((host, port)) = split_host_port(addr) else {
        return Ok(addr.to_string());
    };
    if host.is_empty() {
        return Ok(addr.to_string());
    }

    if let Some(hosts) = hosts
        && let Some(ips) = hosts.lookup(network, host).await
        && let Some(ip) = ips.first()
    {
        debug!(host = %host, ip = %ip, "hit host mapper");
        return Ok(join_host_port(&ip.to_string(), port));
    }

    let Some(resolver) = resolver else {
        return Ok(addr.to_string());
    };
    match resolver.resolve(network, host).await {
        Ok(ips) => match ips.first() {
            Some(ip) => Ok(join_host_port(&ip.to_string(), port)),
            None => Err(ResolveError::NotFound(host.to_string()).into()),
        },
        Err(ResolveError::Invalid) => Ok(addr.to_string()),
        Err(e) => {
            warn!(host = %host, error = %e, "resolve failed");
            Err(ResolveError::NotFound(host.to_string()).into())
        }
    }
}
