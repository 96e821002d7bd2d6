//! Resolver settings and nameserver addresses.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DnsError;

/// Address family ordering applied to answers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prefer {
    /// Keep the upstream order.
    #[default]
    None,
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Udp,
    Tcp,
    Tls,
    Https,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Udp | Scheme::Tcp => 53,
            Scheme::Tls => 853,
            Scheme::Https => 443,
        }
    }
}

/// One upstream nameserver.
///
/// Written as `[scheme://]host[:port][/path]`. A missing scheme means UDP;
/// a missing port is the scheme's standard port; only `https` takes a path
/// (default `/dns-query`). IPv6 hosts must be bracketed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nameserver {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: Option<String>,
}

impl FromStr for Nameserver {
    type Err = DnsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = |why: &str| DnsError::InvalidServer(format!("{s}: {why}"));

        let (scheme, rest) = match s.split_once("://") {
            Some(("udp", rest)) => (Scheme::Udp, rest),
            Some(("tcp", rest)) => (Scheme::Tcp, rest),
            Some(("tls", rest)) => (Scheme::Tls, rest),
            Some(("https", rest)) => (Scheme::Https, rest),
            Some((other, _)) => return Err(bad(&format!("unsupported scheme {other}"))),
            None => (Scheme::Udp, s),
        };

        let (authority, path) = match rest.split_once('/') {
            Some((_, _)) if scheme != Scheme::Https => return Err(bad("unexpected path")),
            Some((a, p)) => (a, Some(format!("/{p}"))),
            None if scheme == Scheme::Https => (rest, Some("/dns-query".to_string())),
            None => (rest, None),
        };

        let (host, port) = if let Some(inner) = authority.strip_prefix('[') {
            let (host, tail) = inner.split_once(']').ok_or_else(|| bad("unclosed bracket"))?;
            match tail {
                "" => (host, None),
                t => (host, Some(t.strip_prefix(':').ok_or_else(|| bad("bad port separator"))?)),
            }
        } else {
            match authority.rsplit_once(':') {
                Some((h, _)) if h.contains(':') => return Err(bad("ipv6 host must be bracketed")),
                Some((h, p)) => (h, Some(p)),
                None => (authority, None),
            }
        };
        if host.is_empty() {
            return Err(bad("empty host"));
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| bad("invalid port"))?,
            None => scheme.default_port(),
        };

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            path,
        })
    }
}

impl fmt::Display for Nameserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.scheme {
            Scheme::Udp => "udp",
            Scheme::Tcp => "tcp",
            Scheme::Tls => "tls",
            Scheme::Https => "https",
        };
        if self.host.contains(':') {
            write!(f, "{scheme}://[{}]:{}", self.host, self.port)?;
        } else {
            write!(f, "{scheme}://{}:{}", self.host, self.port)?;
        }
        if let Some(path) = &self.path {
            f.write_str(path)?;
        }
        Ok(())
    }
}

/// DNS resolver configuration. No nameservers means the system resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default)]
    pub prefer: Prefer,
    /// Per-query timeout; hickory's default when unset.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Cache capacity (number of entries). 0 disables caching.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            nameservers: Vec::new(),
            prefer: Prefer::None,
            timeout: None,
            cache_size: default_cache_size(),
        }
    }
}

impl DnsConfig {
    pub fn with_servers(nameservers: Vec<String>) -> Self {
        Self {
            nameservers,
            ..Self::default()
        }
    }

    pub fn with_prefer(mut self, prefer: Prefer) -> Self {
        self.prefer = prefer;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn parsed_nameservers(&self) -> Result<Vec<Nameserver>, DnsError> {
        self.nameservers.iter().map(|s| s.parse()).collect()
    }
}

fn default_cache_size() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns(s: &str) -> Nameserver {
        s.parse().unwrap()
    }

    #[test]
    fn nameserver_forms() {
        assert_eq!(ns("8.8.8.8").to_string(), "udp://8.8.8.8:53");
        assert_eq!(ns("1.1.1.1:5353").port, 5353);
        assert_eq!(ns("tcp://1.1.1.1").scheme, Scheme::Tcp);
        assert_eq!(ns("tls://dns.example").port, 853);
        assert_eq!(
            ns("https://dns.example").to_string(),
            "https://dns.example:443/dns-query"
        );
        assert_eq!(ns("https://dns.example:8443/q").path.as_deref(), Some("/q"));
        let v6 = ns("udp://[2001:4860:4860::8888]");
        assert_eq!((v6.host.as_str(), v6.port), ("2001:4860:4860::8888", 53));
    }

    #[test]
    fn nameserver_rejects_bad_input() {
        for s in [
            "ftp://8.8.8.8",
            "udp://8.8.8.8/path",
            "tcp://::1:53",
            "udp://",
            "udp://[::1",
            "udp://1.1.1.1:dns",
        ] {
            assert!(s.parse::<Nameserver>().is_err(), "{s}");
        }
    }

    #[test]
    fn config_collects_parse_errors() {
        let cfg = DnsConfig::with_servers(vec!["8.8.8.8".into(), "quic://x".into()]);
        assert!(cfg.parsed_nameservers().is_err());
        let cfg = DnsConfig::with_servers(vec!["8.8.8.8".into()]).with_prefer(Prefer::Ipv4);
        assert_eq!(cfg.parsed_nameservers().unwrap().len(), 1);
        assert_eq!(cfg.prefer, Prefer::Ipv4);
    }
}
