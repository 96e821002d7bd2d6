//! Tunnel and connector identifiers.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

const FLAG_PRIVATE: u8 = 0x80;
const FLAG_UDP: u8 = 0x80;

/// 16-byte tunnel identifier.
///
/// A leading `$` in the text form marks the tunnel private: private tunnels
/// are not reachable through public entrypoints. The flag lives in the top
/// bit of the first byte and is cleared in the display and canonical forms,
/// so a private id prints as the uuid with that bit cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TunnelId([u8; 16]);

impl TunnelId {
    pub fn from_bytes(b: [u8; 16]) -> Self {
        Self(b)
    }

    pub fn into_bytes(self) -> [u8; 16] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.canonical().0 == [0u8; 16]
    }

    pub fn is_private(&self) -> bool {
        self.0[0] & FLAG_PRIVATE != 0
    }

    /// Same id without the private flag; used as pool and ingress key.
    pub fn canonical(&self) -> Self {
        let mut b = self.0;
        b[0] &= !FLAG_PRIVATE;
        Self(b)
    }
}

impl FromStr for TunnelId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (private, s) = match s.strip_prefix('$') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let mut b = *Uuid::parse_str(s)?.as_bytes();
        if private {
            b[0] |= FLAG_PRIVATE;
        }
        Ok(Self(b))
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Uuid::from_bytes(self.canonical().0).fmt(f)
    }
}

/// 16-byte connector identifier.
///
/// Byte 0 bit 7 flags a UDP connector; byte 1 carries the connector weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectorId([u8; 16]);

impl ConnectorId {
    /// Fresh random id with zero weight.
    pub fn new() -> Self {
        let mut b = *Uuid::new_v4().as_bytes();
        b[0] &= !FLAG_UDP;
        b[1] = 0;
        Self(b)
    }

    pub fn new_udp() -> Self {
        let mut id = Self::new();
        id.0[0] |= FLAG_UDP;
        id
    }

    pub fn from_bytes(b: [u8; 16]) -> Self {
        Self(b)
    }

    pub fn into_bytes(self) -> [u8; 16] {
        self.0
    }

    pub fn is_udp(&self) -> bool {
        self.0[0] & FLAG_UDP != 0
    }

    pub fn weight(&self) -> u8 {
        self.0[1]
    }

    pub fn with_weight(mut self, weight: u8) -> Self {
        self.0[1] = weight;
        self
    }
}

impl Default for ConnectorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut b = self.0;
        b[0] &= !FLAG_UDP;
        b[1] = 0;
        Uuid::from_bytes(b).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "3b6ec2a8-6b1c-4a5e-9d2f-0c1d2e3f4a5b";

    #[test]
    fn private_prefix_sets_flag() {
        let public: TunnelId = ID.parse().unwrap();
        let private: TunnelId = format!("${ID}").parse().unwrap();
        assert!(!public.is_private());
        assert!(private.is_private());
        assert_eq!(private.canonical(), public);
        assert_eq!(private.to_string(), ID);
        assert_eq!(public.to_string(), ID);
    }

    #[test]
    fn zero_and_invalid() {
        assert!(TunnelId::default().is_zero());
        let zero_private: TunnelId = "$00000000-0000-0000-0000-000000000000".parse().unwrap();
        assert!(zero_private.is_zero());
        assert!("not-a-uuid".parse::<TunnelId>().is_err());
    }

    #[test]
    fn connector_flags_and_weight() {
        let tcp = ConnectorId::new().with_weight(5);
        let udp = ConnectorId::new_udp();
        assert!(!tcp.is_udp());
        assert!(udp.is_udp());
        assert_eq!(tcp.weight(), 5);
        assert_eq!(udp.weight(), 0);

        // Display is flag-independent.
        let plain = ConnectorId::from_bytes(tcp.with_weight(0).into_bytes());
        assert_eq!(tcp.to_string(), plain.to_string());
        assert_ne!(ConnectorId::new(), ConnectorId::new());
    }
}
