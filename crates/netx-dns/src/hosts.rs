//! Static host table.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use netx_core::resolver::{HostMapper, filter_family};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One `ip hostname [aliases...]` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub ip: IpAddr,
    pub hostname: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl HostEntry {
    /// Parse a hosts(5)-style line. Comments and blank lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.split('#').next()?.trim();
        let mut fields = line.split_whitespace();
        let ip = fields.next()?.parse().ok()?;
        let hostname = fields.next()?.to_string();
        Some(Self {
            ip,
            hostname,
            aliases: fields.map(str::to_string).collect(),
        })
    }
}

/// In-memory host table. Names are matched case-insensitively; a name may
/// map to several addresses of both families.
#[derive(Debug, Default)]
pub struct StaticHosts {
    table: RwLock<HashMap<String, Vec<IpAddr>>>,
}

impl StaticHosts {
    pub fn new(entries: impl IntoIterator<Item = HostEntry>) -> Self {
        let hosts = Self::default();
        hosts.reload(entries);
        hosts
    }

    /// Replace the table in one step.
    pub fn reload(&self, entries: impl IntoIterator<Item = HostEntry>) {
        let mut table: HashMap<String, Vec<IpAddr>> = HashMap::new();
        for e in entries {
            for name in std::iter::once(&e.hostname).chain(e.aliases.iter()) {
                let ips = table.entry(name.to_ascii_lowercase()).or_default();
                if !ips.contains(&e.ip) {
                    ips.push(e.ip);
                }
            }
        }
        *self.table.write() = table;
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

#[async_trait]
impl HostMapper for StaticHosts {
    async fn lookup(&self, network: &str, host: &str) -> Option<Vec<IpAddr>> {
        let ips = self.table.read().get(&host.to_ascii_lowercase()).cloned()?;
        let ips = filter_family(network, ips);
        (!ips.is_empty()).then_some(ips)
    }
}
