//! Relay protocol parsing and serialization.
//!
//! Request and response share one layout:
//!
//! ```text
//! +-----+------------+--------+----------+
//! | VER | CMD/STATUS | FEALEN | FEATURES |
//! +-----+------------+--------+----------+
//! |  1  |     1      |   2    | Variable |
//! +-----+------------+--------+----------+
//! ```
//!
//! `FEALEN` is the byte length of the feature list. Each feature is
//! `TYPE(1) LEN(2) DATA(LEN)`; unknown types are preserved as opaque bytes
//! so that newer peers can add features without breaking older ones.

mod io;
mod tunnel;

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, Bytes, BytesMut};
use netx_core::net::{Network, join_host_port, split_host_port};

pub use io::{ProtoError, read_request, read_response, write_request, write_response};
pub use tunnel::{ConnectorId, TunnelId};

pub const VERSION1: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
/// Low bits of CMD select the command.
pub const CMD_MASK: u8 = 0x0f;
/// Flag bit: UDP semantics for either command.
pub const FLAG_UDP: u8 = 0x80;

pub const FEATURE_USER_AUTH: u8 = 0x01;
pub const FEATURE_ADDR: u8 = 0x02;
pub const FEATURE_TUNNEL: u8 = 0x03;
pub const FEATURE_NETWORK: u8 = 0x04;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const MAX_DOMAIN_LEN: usize = 255;
/// Header bytes before the feature list.
pub const HEADER_LEN: usize = 4;

pub const NETWORK_TCP: u16 = 0x00;
pub const NETWORK_UDP: u16 = 0x01;
pub const NETWORK_IP: u16 = 0x02;
pub const NETWORK_UNIX: u16 = 0x10;
pub const NETWORK_SERIAL: u16 = 0x11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    InvalidVersion(u8),
    InvalidAtyp,
    InvalidUtf8,
    /// A feature's declared length does not match its content.
    MalformedFeature(u8),
    /// Feature list runs past FEALEN.
    FeatureOverflow,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::InvalidVersion(v) => write!(f, "bad version {v}"),
            ParseError::InvalidAtyp => f.write_str("bad address type"),
            ParseError::InvalidUtf8 => f.write_str("bad utf-8 in feature"),
            ParseError::MalformedFeature(t) => write!(f, "malformed feature {t}"),
            ParseError::FeatureOverflow => f.write_str("feature list overflows header length"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    DomainTooLong,
    /// Username or password longer than 255 bytes.
    CredentialTooLong,
    /// A feature or the feature list exceeds 65535 bytes.
    FeatureTooLarge,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::DomainTooLong => f.write_str("domain too long"),
            WriteError::CredentialTooLong => f.write_str("credential too long"),
            WriteError::FeatureTooLarge => f.write_str("feature too large"),
        }
    }
}

/// Incremental parse outcome.
///
/// - `Complete(T)` - parsing succeeded.
/// - `Incomplete(n)` - `n` is the **minimum total bytes** needed.
/// - `Invalid(e)` - protocol violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult<T> {
    Complete(T),
    Incomplete(usize),
    Invalid(ParseError),
}

// ── Status ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    BadRequest,
    Unauthorized,
    Forbidden,
    Timeout,
    ServiceUnavailable,
    HostUnreachable,
    NetworkUnreachable,
    InternalServerError,
    Other(u8),
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Ok => 0x00,
            Status::BadRequest => 0x01,
            Status::Unauthorized => 0x02,
            Status::Forbidden => 0x03,
            Status::Timeout => 0x04,
            Status::ServiceUnavailable => 0x05,
            Status::HostUnreachable => 0x06,
            Status::NetworkUnreachable => 0x07,
            Status::InternalServerError => 0x08,
            Status::Other(c) => c,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Status::Ok,
            0x01 => Status::BadRequest,
            0x02 => Status::Unauthorized,
            0x03 => Status::Forbidden,
            0x04 => Status::Timeout,
            0x05 => Status::ServiceUnavailable,
            0x06 => Status::HostUnreachable,
            0x07 => Status::NetworkUnreachable,
            0x08 => Status::InternalServerError,
            c => Status::Other(c),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "ok",
            Status::BadRequest => "bad request",
            Status::Unauthorized => "unauthorized",
            Status::Forbidden => "forbidden",
            Status::Timeout => "timeout",
            Status::ServiceUnavailable => "service unavailable",
            Status::HostUnreachable => "host unreachable",
            Status::NetworkUnreachable => "network unreachable",
            Status::InternalServerError => "internal server error",
            Status::Other(c) => return write!(f, "status {c}"),
        };
        f.write_str(s)
    }
}

// ── Address ──

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    /// May be empty (`":8080"` binds on all interfaces).
    Domain(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: Host,
    pub port: u16,
}

impl Address {
    /// Parse `"host:port"`. IP literals become IP hosts.
    pub fn parse(addr: &str) -> Option<Self> {
        let (host, port) = split_host_port(addr).ok()?;
        let host = match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => Host::Ipv4(ip),
            Ok(IpAddr::V6(ip)) => Host::Ipv6(ip),
            Err(_) => Host::Domain(host.to_string()),
        };
        Some(Self { host, port })
    }

    pub fn host_string(&self) -> String {
        match &self.host {
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
            Host::Domain(d) => d.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join_host_port(&self.host_string(), self.port))
    }
}

impl From<std::net::SocketAddr> for Address {
    fn from(sa: std::net::SocketAddr) -> Self {
        let host = match sa.ip() {
            IpAddr::V4(ip) => Host::Ipv4(ip),
            IpAddr::V6(ip) => Host::Ipv6(ip),
        };
        Self {
            host,
            port: sa.port(),
        }
    }
}

// ── Features ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feature {
    UserAuth { username: String, password: String },
    Addr(Address),
    /// Tunnel id, plus the connector weight carried by bind requests.
    Tunnel { id: [u8; 16], weight: Option<u8> },
    Network(u16),
    Unknown { kind: u8, data: Bytes },
}

impl Feature {
    pub fn kind(&self) -> u8 {
        match self {
            Feature::UserAuth { .. } => FEATURE_USER_AUTH,
            Feature::Addr(_) => FEATURE_ADDR,
            Feature::Tunnel { .. } => FEATURE_TUNNEL,
            Feature::Network(_) => FEATURE_NETWORK,
            Feature::Unknown { kind, .. } => *kind,
        }
    }

    pub fn tunnel(id: TunnelId) -> Self {
        Feature::Tunnel {
            id: id.into_bytes(),
            weight: None,
        }
    }

    pub fn network(network: Network) -> Self {
        Feature::Network(network_id(network))
    }
}

pub fn network_id(network: Network) -> u16 {
    match network {
        Network::Tcp => NETWORK_TCP,
        Network::Udp => NETWORK_UDP,
        Network::Ip => NETWORK_IP,
        Network::Unix => NETWORK_UNIX,
        Network::Serial => NETWORK_SERIAL,
    }
}

pub fn network_from_id(id: u16) -> Network {
    match id {
        NETWORK_UDP => Network::Udp,
        NETWORK_IP => Network::Ip,
        NETWORK_UNIX => Network::Unix,
        NETWORK_SERIAL => Network::Serial,
        _ => Network::Tcp,
    }
}

/// Feature list accessors shared by requests and responses.
pub trait Features {
    fn features(&self) -> &[Feature];

    fn user_auth(&self) -> Option<(&str, &str)> {
        self.features().iter().find_map(|f| match f {
            Feature::UserAuth { username, password } => Some((username.as_str(), password.as_str())),
            _ => None,
        })
    }

    /// Address features in order (relay puts source first, destination last).
    fn addrs(&self) -> Vec<&Address> {
        self.features()
            .iter()
            .filter_map(|f| match f {
                Feature::Addr(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    fn tunnel(&self) -> Option<([u8; 16], Option<u8>)> {
        self.features().iter().find_map(|f| match f {
            Feature::Tunnel { id, weight } => Some((*id, *weight)),
            _ => None,
        })
    }

    fn network(&self) -> Option<Network> {
        self.features().iter().find_map(|f| match f {
            Feature::Network(id) => Some(network_from_id(*id)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub version: u8,
    pub cmd: u8,
    pub features: Vec<Feature>,
}

impl Request {
    pub fn new(cmd: u8) -> Self {
        Self {
            version: VERSION1,
            cmd,
            features: Vec::new(),
        }
    }

    pub fn with(mut self, feature: Feature) -> Self {
        self.features.push(feature);
        self
    }

    /// Command with flags stripped. 0 is read as CONNECT.
    pub fn command(&self) -> u8 {
        match self.cmd & CMD_MASK {
            0 => CMD_CONNECT,
            c => c,
        }
    }

    pub fn is_udp(&self) -> bool {
        self.cmd & FLAG_UDP != 0
    }
}

impl Features for Request {
    fn features(&self) -> &[Feature] {
        &self.features
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: u8,
    pub status: Status,
    pub features: Vec<Feature>,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Self {
            version: VERSION1,
            status,
            features: Vec::new(),
        }
    }

    pub fn with(mut self, feature: Feature) -> Self {
        self.features.push(feature);
        self
    }
}

impl Features for Response {
    fn features(&self) -> &[Feature] {
        &self.features
    }
}

// ── Parsing ──

/// Parse a request. On success returns the request and the bytes consumed.
pub fn parse_request(buf: &[u8]) -> ParseResult<(Request, usize)> {
    match parse_frame(buf) {
        ParseResult::Complete((version, cmd, features, n)) => ParseResult::Complete((
            Request {
                version,
                cmd,
                features,
            },
            n,
        )),
        ParseResult::Incomplete(n) => ParseResult::Incomplete(n),
        ParseResult::Invalid(e) => ParseResult::Invalid(e),
    }
}

pub fn parse_response(buf: &[u8]) -> ParseResult<(Response, usize)> {
    match parse_frame(buf) {
        ParseResult::Complete((version, status, features, n)) => ParseResult::Complete((
            Response {
                version,
                status: Status::from_code(status),
                features,
            },
            n,
        )),
        ParseResult::Incomplete(n) => ParseResult::Incomplete(n),
        ParseResult::Invalid(e) => ParseResult::Invalid(e),
    }
}

/// Total frame length declared by a 4-byte header.
pub fn frame_len(header: &[u8; HEADER_LEN]) -> usize {
    HEADER_LEN + read_u16(&header[2..4]) as usize
}

fn parse_frame(buf: &[u8]) -> ParseResult<(u8, u8, Vec<Feature>, usize)> {
    if buf.len() < HEADER_LEN {
        return ParseResult::Incomplete(HEADER_LEN);
    }
    let version = buf[0];
    if version != VERSION1 {
        return ParseResult::Invalid(ParseError::InvalidVersion(version));
    }
    let code = buf[1];
    let total = HEADER_LEN + read_u16(&buf[2..4]) as usize;
    if buf.len() < total {
        return ParseResult::Incomplete(total);
    }
    match parse_features(&buf[HEADER_LEN..total]) {
        Ok(features) => ParseResult::Complete((version, code, features, total)),
        Err(e) => ParseResult::Invalid(e),
    }
}

fn parse_features(mut buf: &[u8]) -> Result<Vec<Feature>, ParseError> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 3 {
            return Err(ParseError::FeatureOverflow);
        }
        let kind = buf[0];
        let len = read_u16(&buf[1..3]) as usize;
        if buf.len() < 3 + len {
            return Err(ParseError::FeatureOverflow);
        }
        let data = &buf[3..3 + len];
        out.push(parse_feature(kind, data)?);
        buf = &buf[3 + len..];
    }
    Ok(out)
}

fn parse_feature(kind: u8, data: &[u8]) -> Result<Feature, ParseError> {
    let malformed = ParseError::MalformedFeature(kind);
    match kind {
        FEATURE_USER_AUTH => {
            let ulen = *data.first().ok_or(malformed)? as usize;
            let user = data.get(1..1 + ulen).ok_or(malformed)?;
            let plen = *data.get(1 + ulen).ok_or(malformed)? as usize;
            let pass = data.get(2 + ulen..2 + ulen + plen).ok_or(malformed)?;
            if data.len() != 2 + ulen + plen {
                return Err(malformed);
            }
            Ok(Feature::UserAuth {
                username: utf8(user)?,
                password: utf8(pass)?,
            })
        }
        FEATURE_ADDR => {
            let atyp = *data.first().ok_or(malformed)?;
            let rest = &data[1..];
            let (host, used) = match atyp {
                ATYP_IPV4 => {
                    let b = rest.get(..4).ok_or(malformed)?;
                    (Host::Ipv4(Ipv4Addr::new(b[0], b[1], b[2], b[3])), 4)
                }
                ATYP_IPV6 => {
                    let b = rest.get(..16).ok_or(malformed)?;
                    let mut ip = [0u8; 16];
                    ip.copy_from_slice(b);
                    (Host::Ipv6(Ipv6Addr::from(ip)), 16)
                }
                ATYP_DOMAIN => {
                    let len = *rest.first().ok_or(malformed)? as usize;
                    let d = rest.get(1..1 + len).ok_or(malformed)?;
                    (Host::Domain(utf8(d)?), 1 + len)
                }
                _ => return Err(ParseError::InvalidAtyp),
            };
            let port = rest.get(used..used + 2).ok_or(malformed)?;
            if rest.len() != used + 2 {
                return Err(malformed);
            }
            Ok(Feature::Addr(Address {
                host,
                port: read_u16(port),
            }))
        }
        FEATURE_TUNNEL => {
            if data.len() < 16 {
                return Err(malformed);
            }
            let mut id = [0u8; 16];
            id.copy_from_slice(&data[..16]);
            Ok(Feature::Tunnel {
                id,
                weight: data.get(16).copied(),
            })
        }
        FEATURE_NETWORK => {
            if data.len() != 2 {
                return Err(malformed);
            }
            Ok(Feature::Network(read_u16(data)))
        }
        _ => Ok(Feature::Unknown {
            kind,
            data: Bytes::copy_from_slice(data),
        }),
    }
}

fn utf8(b: &[u8]) -> Result<String, ParseError> {
    std::str::from_utf8(b)
        .map(str::to_string)
        .map_err(|_| ParseError::InvalidUtf8)
}

// ── Writing ──

/// Serialize a request into `buf`.
pub fn encode_request(buf: &mut BytesMut, req: &Request) -> Result<(), WriteError> {
    encode_frame(buf, req.version, req.cmd, &req.features)
}

pub fn encode_response(buf: &mut BytesMut, resp: &Response) -> Result<(), WriteError> {
    encode_frame(buf, resp.version, resp.status.code(), &resp.features)
}

#[allow(clippy::cast_possible_truncation)]
fn encode_frame(buf: &mut BytesMut, version: u8, code: u8, features: &[Feature]) -> Result<(), WriteError> {
    let mut body = BytesMut::new();
    for f in features {
        encode_feature(&mut body, f)?;
    }
    if body.len() > u16::MAX as usize {
        return Err(WriteError::FeatureTooLarge);
    }
    buf.reserve(HEADER_LEN + body.len());
    buf.put_u8(version);
    buf.put_u8(code);
    buf.put_u16(body.len() as u16);
    buf.put_slice(&body);
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
fn encode_feature(buf: &mut BytesMut, feature: &Feature) -> Result<(), WriteError> {
    let mut data = BytesMut::new();
    match feature {
        Feature::UserAuth { username, password } => {
            if username.len() > 255 || password.len() > 255 {
                return Err(WriteError::CredentialTooLong);
            }
            data.put_u8(username.len() as u8);
            data.put_slice(username.as_bytes());
            data.put_u8(password.len() as u8);
            data.put_slice(password.as_bytes());
        }
        Feature::Addr(addr) => {
            match &addr.host {
                Host::Ipv4(ip) => {
                    data.put_u8(ATYP_IPV4);
                    data.put_slice(&ip.octets());
                }
                Host::Ipv6(ip) => {
                    data.put_u8(ATYP_IPV6);
                    data.put_slice(&ip.octets());
                }
                Host::Domain(d) => {
                    if d.len() > MAX_DOMAIN_LEN {
                        return Err(WriteError::DomainTooLong);
                    }
                    data.put_u8(ATYP_DOMAIN);
                    data.put_u8(d.len() as u8);
                    data.put_slice(d.as_bytes());
                }
            }
            data.put_u16(addr.port);
        }
        Feature::Tunnel { id, weight } => {
            data.put_slice(id);
            if let Some(w) = weight {
                data.put_u8(*w);
            }
        }
        Feature::Network(n) => data.put_u16(*n),
        Feature::Unknown { data: raw, .. } => {
            if raw.len() > u16::MAX as usize {
                return Err(WriteError::FeatureTooLarge);
            }
            data.put_slice(raw);
        }
    }
    buf.put_u8(feature.kind());
    buf.put_u16(data.len() as u16);
    buf.put_slice(&data);
    Ok(())
}

#[inline]
fn read_u16(buf: &[u8]) -> u16 {
    debug_assert!(buf.len() >= 2, "read_u16 requires at least 2 bytes");
    u16::from_be_bytes([buf[0], buf[1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_request() -> Request {
        Request::new(CMD_BIND | FLAG_UDP)
            .with(Feature::UserAuth {
                username: "alice".into(),
                password: "pw".into(),
            })
            .with(Feature::Addr(Address::parse("10.0.0.1:1080").unwrap()))
            .with(Feature::Addr(Address::parse("[2001:db8::1]:443").unwrap()))
            .with(Feature::Addr(Address::parse("example.com:80").unwrap()))
            .with(Feature::Tunnel {
                id: [7u8; 16],
                weight: Some(3),
            })
            .with(Feature::Network(NETWORK_UDP))
    }

    #[test]
    fn request_round_trip() {
        let req = full_request();
        let mut buf = BytesMut::new();
        encode_request(&mut buf, &req).unwrap();
        match parse_request(&buf) {
            ParseResult::Complete((got, n)) => {
                assert_eq!(got, req);
                assert_eq!(n, buf.len());
                assert_eq!(got.command(), CMD_BIND);
                assert!(got.is_udp());
                assert_eq!(got.user_auth(), Some(("alice", "pw")));
                assert_eq!(got.addrs().len(), 3);
                assert_eq!(got.tunnel(), Some(([7u8; 16], Some(3))));
                assert_eq!(got.network(), Some(Network::Udp));
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn response_round_trip() {
        let resp = Response::new(Status::HostUnreachable)
            .with(Feature::Addr(Address::parse(":8080").unwrap()));
        let mut buf = BytesMut::new();
        encode_response(&mut buf, &resp).unwrap();
        match parse_response(&buf) {
            ParseResult::Complete((got, _)) => {
                assert_eq!(got, resp);
                assert_eq!(got.addrs()[0].host, Host::Domain(String::new()));
            }
            other => panic!("unexpected parse result: {other:?}"),
        }
    }

    #[test]
    fn wire_layout_is_stable() {
        let req = Request::new(CMD_CONNECT)
            .with(Feature::Addr(Address::parse("1.2.3.4:80").unwrap()));
        let mut buf = BytesMut::new();
        encode_request(&mut buf, &req).unwrap();
        assert_eq!(
            &buf[..],
            &[1, 1, 0, 10, FEATURE_ADDR, 0, 7, ATYP_IPV4, 1, 2, 3, 4, 0, 80]
        );
    }

    #[test]
    fn unknown_features_are_skipped() {
        let mut buf = BytesMut::new();
        let req = Request::new(CMD_CONNECT)
            .with(Feature::Unknown {
                kind: 0x7e,
                data: Bytes::from_static(b"future"),
            })
            .with(Feature::Addr(Address::parse("host.test:9").unwrap()));
        encode_request(&mut buf, &req).unwrap();
        let ParseResult::Complete((got, _)) = parse_request(&buf) else {
            panic!("parse failed");
        };
        assert_eq!(got.addrs()[0].to_string(), "host.test:9");
        assert_eq!(got.features[0].kind(), 0x7e);
    }

    #[test]
    fn incomplete_and_invalid() {
        let mut buf = BytesMut::new();
        encode_request(&mut buf, &full_request()).unwrap();
        assert_eq!(parse_request(&buf[..2]), ParseResult::Incomplete(HEADER_LEN));
        assert_eq!(parse_request(&buf[..10]), ParseResult::Incomplete(buf.len()));

        let mut bad = buf.clone();
        bad[0] = 5;
        assert_eq!(parse_request(&bad), ParseResult::Invalid(ParseError::InvalidVersion(5)));

        // Feature length pointing past FEALEN
        let raw = [1u8, 1, 0, 3, FEATURE_NETWORK, 0, 9];
        assert_eq!(parse_request(&raw), ParseResult::Invalid(ParseError::FeatureOverflow));

        let raw = [1u8, 1, 0, 4, FEATURE_NETWORK, 0, 1, 0];
        assert_eq!(
            parse_request(&raw),
            ParseResult::Invalid(ParseError::MalformedFeature(FEATURE_NETWORK))
        );
    }

    #[test]
    fn command_zero_means_connect() {
        assert_eq!(Request::new(0).command(), CMD_CONNECT);
        assert_eq!(Request::new(FLAG_UDP).command(), CMD_CONNECT);
        assert!(!Request::new(CMD_BIND).is_udp());
    }

    #[test]
    fn write_limits() {
        let mut buf = BytesMut::new();
        let long = "a".repeat(256);
        let req = Request::new(CMD_CONNECT).with(Feature::Addr(Address {
            host: Host::Domain(long.clone()),
            port: 1,
        }));
        assert_eq!(encode_request(&mut buf, &req), Err(WriteError::DomainTooLong));
        let req = Request::new(CMD_CONNECT).with(Feature::UserAuth {
            username: long,
            password: String::new(),
        });
        assert_eq!(encode_request(&mut buf, &req), Err(WriteError::CredentialTooLong));
    }

    #[test]
    fn status_codes() {
        for code in 0..=8u8 {
            assert_eq!(Status::from_code(code).code(), code);
        }
        assert_eq!(Status::from_code(0x42), Status::Other(0x42));
    }
}
