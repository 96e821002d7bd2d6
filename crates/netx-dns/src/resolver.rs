//! hickory-backed implementation of the `Resolver` contract.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::xfer::Protocol;
use hickory_resolver::config::{NameServerConfig, NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use netx_core::net::split_host_port;
use netx_core::resolver::{self, ResolveError, filter_family};
use tracing::{debug, trace};

use crate::config::{DnsConfig, Nameserver, Prefer, Scheme};
use crate::error::DnsError;

/// Caching resolver over the system or a fixed nameserver list.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct DnsResolver {
    resolver: Arc<TokioResolver>,
    prefer: Prefer,
    upstream: Arc<[String]>,
}

impl std::fmt::Debug for DnsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolver")
            .field("upstream", &self.upstream)
            .field("prefer", &self.prefer)
            .finish()
    }
}

impl DnsResolver {
    pub fn new(config: &DnsConfig) -> Result<Self, DnsError> {
        let nameservers = config.parsed_nameservers()?;
        let mut builder = if nameservers.is_empty() {
            TokioResolver::builder_tokio()
                .map_err(|e| DnsError::InvalidServer(format!("system config: {e}")))?
        } else {
            let group = nameservers
                .iter()
                .map(name_server)
                .collect::<Result<Vec<_>, _>>()?;
            TokioResolver::builder_with_config(
                ResolverConfig::from_parts(None, vec![], NameServerConfigGroup::from(group)),
                TokioConnectionProvider::default(),
            )
        };

        let opts = builder.options_mut();
        opts.cache_size = config.cache_size;
        opts.preserve_intermediates = true;
        if let Some(t) = config.timeout {
            opts.timeout = t;
        }

        let upstream: Arc<[String]> = if nameservers.is_empty() {
            Arc::from(vec!["system".to_string()])
        } else {
            nameservers.iter().map(|n| n.to_string()).collect()
        };
        debug!(upstream = ?upstream, prefer = ?config.prefer, "dns resolver ready");

        Ok(Self {
            resolver: Arc::new(builder.build()),
            prefer: config.prefer,
            upstream,
        })
    }

    /// All addresses of `host` in preference order. IP literals are returned
    /// as is.
    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let answer = self.resolver.lookup_ip(host).await?;
        let ips = order(answer.iter().collect(), self.prefer);
        if ips.is_empty() {
            return Err(DnsError::NoResults(host.to_string()));
        }
        trace!(host, resolved = ?ips, "dns answer");
        Ok(ips)
    }

    /// Resolve `host:port` to its first address.
    pub async fn resolve_addr(&self, addr: &str) -> Result<SocketAddr, DnsError> {
        if let Ok(sa) = addr.parse::<SocketAddr>() {
            return Ok(sa);
        }
        let (host, port) =
            split_host_port(addr).map_err(|e| DnsError::NoResults(e.to_string()))?;
        let ip = self.lookup(host).await?[0];
        Ok(SocketAddr::new(ip, port))
    }
}

#[async_trait]
impl resolver::Resolver for DnsResolver {
    async fn resolve(&self, network: &str, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        if host.is_empty() {
            return Err(ResolveError::Invalid);
        }
        let ips = filter_family(network, self.lookup(host).await?);
        if ips.is_empty() {
            return Err(ResolveError::NotFound(host.to_string()));
        }
        Ok(ips)
    }
}

/// Stable sort by family; the upstream order holds within a family.
fn order(mut ips: Vec<IpAddr>, prefer: Prefer) -> Vec<IpAddr> {
    match prefer {
        Prefer::None => {}
        Prefer::Ipv4 => ips.sort_by_key(|ip| !ip.is_ipv4()),
        Prefer::Ipv6 => ips.sort_by_key(|ip| !ip.is_ipv6()),
    }
    ips
}

fn name_server(ns: &Nameserver) -> Result<NameServerConfig, DnsError> {
    let socket_addr = server_addr(&ns.host, ns.port)?;
    let (protocol, tls_name) = match ns.scheme {
        Scheme::Udp => (Protocol::Udp, None),
        Scheme::Tcp => (Protocol::Tcp, None),
        Scheme::Tls => (Protocol::Tls, Some(ns.host.clone())),
        Scheme::Https => (Protocol::Https, Some(ns.host.clone())),
    };
    Ok(NameServerConfig {
        socket_addr,
        protocol,
        tls_dns_name: tls_name,
        http_endpoint: ns.path.clone(),
        trust_negative_responses: false,
        bind_addr: None,
    })
}

/// Nameserver hostnames are looked up once, through the system resolver.
fn server_addr(host: &str, port: u16) -> Result<SocketAddr, DnsError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| DnsError::InvalidServer(format!("{host}: {e}")))?
        .next()
        .ok_or_else(|| DnsError::InvalidServer(format!("{host}: no addresses")))
}

#[cfg(test)]
mod tests {
    use netx_core::resolver::Resolver as _;

    use super::*;

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn order_keeps_upstream_order_within_family() {
        let mixed = ips(&["2001:db8::1", "10.0.0.1", "2001:db8::2", "10.0.0.2"]);
        assert_eq!(order(mixed.clone(), Prefer::None), mixed);
        assert_eq!(
            order(mixed.clone(), Prefer::Ipv4),
            ips(&["10.0.0.1", "10.0.0.2", "2001:db8::1", "2001:db8::2"])
        );
        assert_eq!(
            order(mixed, Prefer::Ipv6),
            ips(&["2001:db8::1", "2001:db8::2", "10.0.0.1", "10.0.0.2"])
        );
    }

    #[test]
    fn name_server_maps_scheme() {
        let ns: Nameserver = "https://9.9.9.9/dns-query".parse().unwrap();
        let cfg = name_server(&ns).unwrap();
        assert_eq!(cfg.protocol, Protocol::Https);
        assert_eq!(cfg.socket_addr, "9.9.9.9:443".parse().unwrap());
        assert_eq!(cfg.tls_dns_name.as_deref(), Some("9.9.9.9"));
        assert_eq!(cfg.http_endpoint.as_deref(), Some("/dns-query"));

        let ns: Nameserver = "tcp://[::1]:5353".parse().unwrap();
        let cfg = name_server(&ns).unwrap();
        assert_eq!(cfg.protocol, Protocol::Tcp);
        assert_eq!(cfg.socket_addr, "[::1]:5353".parse().unwrap());
    }

    #[tokio::test]
    async fn custom_upstream_is_reported() {
        let r = DnsResolver::new(&DnsConfig::with_servers(vec!["1.1.1.1".into()])).unwrap();
        assert!(format!("{r:?}").contains("udp://1.1.1.1:53"));
        assert!(DnsResolver::new(&DnsConfig::with_servers(vec!["ftp://x".into()])).is_err());
    }

    #[tokio::test]
    async fn ip_literals_skip_dns() {
        let resolver = DnsResolver::new(&DnsConfig::with_servers(vec!["127.0.0.1".into()])).unwrap();
        let sa = resolver.resolve_addr("127.0.0.1:8080").await.unwrap();
        assert_eq!(sa, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());

        let got = resolver.resolve("ip", "10.0.0.1").await.unwrap();
        assert_eq!(got, ips(&["10.0.0.1"]));
        assert!(matches!(
            resolver.resolve("ip6", "10.0.0.1").await,
            Err(ResolveError::NotFound(_))
        ));
        assert_eq!(resolver.resolve("ip", "").await, Err(ResolveError::Invalid));
    }
}
