//! Network primitives: the stream and datagram connection abstractions,
//! network kinds and `host:port` helpers.

mod conn;
mod packet;
pub mod udp;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use conn::{AsyncStream, Conn};
pub use packet::{PacketConn, UdpStream};

/// Transport network of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Udp,
    Ip,
    Unix,
    Serial,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
            Network::Ip => "ip",
            Network::Unix => "unix",
            Network::Serial => "serial",
        }
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, Network::Udp)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "tcp" | "tcp4" | "tcp6" => Ok(Network::Tcp),
            "udp" | "udp4" | "udp6" => Ok(Network::Udp),
            "ip" | "ip4" | "ip6" => Ok(Network::Ip),
            "unix" => Ok(Network::Unix),
            "serial" => Ok(Network::Serial),
            other => Err(AddrError::UnknownNetwork(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
    #[error("missing port in address {0}")]
    MissingPort(String),
    #[error("invalid port in address {0}")]
    InvalidPort(String),
    #[error("unknown network {0}")]
    UnknownNetwork(String),
}

/// Split `"host:port"` into (host, port).
///
/// Handles IPv6 bracket notation (`"[::1]:443"`) and an empty host (`":8080"`).
pub fn split_host_port(addr: &str) -> Result<(&str, u16), AddrError> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        rest.split_once("]:")
            .ok_or_else(|| AddrError::MissingPort(addr.to_string()))?
    } else {
        addr.rsplit_once(':')
            .ok_or_else(|| AddrError::MissingPort(addr.to_string()))?
    };
    if host.contains(':') && !addr.starts_with('[') {
        return Err(AddrError::MissingPort(addr.to_string()));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| AddrError::InvalidPort(addr.to_string()))?;
    Ok((host, port))
}

/// Host part of an address, or the whole input when it carries no port.
pub fn host_of(addr: &str) -> &str {
    split_host_port(addr).map(|(h, _)| h).unwrap_or(addr)
}

/// Join host and port, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_handles_ipv6_and_empty_host() {
        assert_eq!(split_host_port("[::1]:443").unwrap(), ("::1", 443));
        assert_eq!(split_host_port(":8080").unwrap(), ("", 8080));
        assert_eq!(split_host_port("example.com:80").unwrap(), ("example.com", 80));
        assert!(split_host_port("example.com").is_err());
        assert!(split_host_port("::1").is_err());
        assert!(split_host_port("a:http").is_err());
    }

    #[test]
    fn join_brackets_ipv6() {
        assert_eq!(join_host_port("::1", 53), "[::1]:53");
        assert_eq!(join_host_port("10.0.0.1", 53), "10.0.0.1:53");
    }

    #[test]
    fn network_parse_accepts_family_suffixes() {
        assert_eq!("udp6".parse::<Network>().unwrap(), Network::Udp);
        assert_eq!("".parse::<Network>().unwrap(), Network::Tcp);
        assert!("sctp".parse::<Network>().is_err());
    }
}
