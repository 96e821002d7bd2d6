//! Address bypass rules.
//!
//! A bypass answers "should this address skip the current path". Matchers
//! accept IP addresses, CIDR blocks, exact domains and wildcard domains
//! (`*.example.com` or `.example.com`, both matching the apex too). With
//! `whitelist` set the answer is inverted: only listed addresses pass.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use crate::net::{Network, host_of};

pub trait Bypass: Send + Sync {
    /// `address` may be a bare host or `host:port`.
    fn contains(&self, network: Network, address: &str) -> bool;
}

impl<B: Bypass + ?Sized> Bypass for Arc<B> {
    fn contains(&self, network: Network, address: &str) -> bool {
        (**self).contains(network, address)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Matcher {
    Ip(IpAddr),
    Net(IpNet),
    Domain(String),
    /// Suffix without the leading dot.
    Wildcard(String),
}

impl Matcher {
    fn parse(pattern: &str) -> Option<Self> {
        let p = pattern.trim().to_ascii_lowercase();
        if p.is_empty() {
            return None;
        }
        if let Ok(ip) = p.parse::<IpAddr>() {
            return Some(Matcher::Ip(ip));
        }
        if let Ok(net) = p.parse::<IpNet>() {
            return Some(Matcher::Net(net));
        }
        if let Some(rest) = p.strip_prefix("*.").or_else(|| p.strip_prefix('.')) {
            return Some(Matcher::Wildcard(rest.to_string()));
        }
        Some(Matcher::Domain(p))
    }

    fn matches(&self, host: &str, ip: Option<IpAddr>) -> bool {
        match self {
            Matcher::Ip(want) => ip == Some(*want),
            Matcher::Net(net) => ip.is_some_and(|ip| net.contains(&ip)),
            Matcher::Domain(d) => host == d,
            Matcher::Wildcard(suffix) => {
                host == suffix
                    || host
                        .strip_suffix(suffix.as_str())
                        .is_some_and(|head| head.ends_with('.'))
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddrBypass {
    matchers: Vec<Matcher>,
    whitelist: bool,
}

impl AddrBypass {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            matchers: patterns
                .into_iter()
                .filter_map(|p| Matcher::parse(p.as_ref()))
                .collect(),
            whitelist: false,
        }
    }

    pub fn whitelist(mut self, whitelist: bool) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }
}

impl Bypass for AddrBypass {
    fn contains(&self, _network: Network, address: &str) -> bool {
        if address.is_empty() {
            return false;
        }
        let host = host_of(address);
        let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
        let ip = host.parse::<IpAddr>().ok();
        let matched = self.matchers.iter().any(|m| m.matches(&host, ip));
        matched != self.whitelist
    }
}

/// Combines several bypasses; an address is bypassed if any member says so.
#[derive(Clone, Default)]
pub struct BypassGroup {
    members: Vec<Arc<dyn Bypass>>,
}

impl BypassGroup {
    pub fn new(members: Vec<Arc<dyn Bypass>>) -> Self {
        Self { members }
    }
}

impl Bypass for BypassGroup {
    fn contains(&self, network: Network, address: &str) -> bool {
        self.members.iter().any(|b| b.contains(network, address))
    }
}
