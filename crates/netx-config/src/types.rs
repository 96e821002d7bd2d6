//! Configuration type definitions.
//!
//! The document mirrors the runtime object graph: top-level named sections
//! (`chains`, `hops`, `authers`, `bypasses`, ...) are referenced by name from
//! services, chains and nodes. Protocol knobs travel in free-form `metadata`
//! maps that the handlers, connectors and dialers read themselves.

use std::time::Duration;

use netx_core::Metadata;
use serde::{Deserialize, Serialize};

use crate::defaults::*;
use crate::duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub hops: Vec<HopConfig>,
    #[serde(default)]
    pub authers: Vec<AutherConfig>,
    #[serde(default)]
    pub bypasses: Vec<BypassConfig>,
    #[serde(default)]
    pub resolvers: Vec<ResolverConfig>,
    #[serde(default)]
    pub hosts: Vec<HostsConfig>,
    #[serde(default)]
    pub ingresses: Vec<IngressConfig>,
    #[serde(default)]
    pub sds: Vec<SdConfig>,
    /// Traffic limiters.
    #[serde(default)]
    pub limiters: Vec<LimiterConfig>,
    /// Request rate limiters.
    #[serde(default)]
    pub rlimiters: Vec<RateLimiterConfig>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
}

// ── Services ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub handler: HandlerConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    /// Static forwarding targets for `forward` handlers and relay forward mode.
    #[serde(default)]
    pub forwarder: Option<ForwarderConfig>,
    #[serde(default)]
    pub bypass: Option<String>,
    #[serde(default)]
    pub resolver: Option<String>,
    #[serde(default)]
    pub hosts: Option<String>,
    /// Traffic limiter name.
    #[serde(default)]
    pub limiter: Option<String>,
    /// Rate limiter name.
    #[serde(default)]
    pub rlimiter: Option<String>,
    /// Maximum concurrent connections (None = unlimited).
    #[serde(default, rename = "maxConnections")]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// `relay`, `tunnel` or `forward`.
    #[serde(rename = "type", default = "default_handler_type")]
    pub kind: String,
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default, rename = "chainGroup")]
    pub chain_group: Option<ChainGroupConfig>,
    /// Router attempts beyond the first.
    #[serde(default = "default_router_retries")]
    pub retries: usize,
    #[serde(default)]
    pub auther: Option<String>,
    /// Inline single credential, used when no `auther` is named.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub ingress: Option<String>,
    #[serde(default)]
    pub sd: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            kind: default_handler_type(),
            chain: None,
            chain_group: None,
            retries: default_router_retries(),
            auther: None,
            auth: None,
            ingress: None,
            sd: None,
            metadata: Metadata::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// `tcp`, `tls`, `rtcp` or `rudp`.
    #[serde(rename = "type", default = "default_listener_type")]
    pub kind: String,
    /// Chain used by `rtcp`/`rudp` listeners to bind remotely.
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            kind: default_listener_type(),
            chain: None,
            tls: None,
            metadata: Metadata::default(),
        }
    }
}

/// Server certificate. Without files an ephemeral self-signed one is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default, rename = "certFile")]
    pub cert_file: Option<String>,
    #[serde(default, rename = "keyFile")]
    pub key_file: Option<String>,
    /// Client side: SNI to send.
    #[serde(default, rename = "serverName")]
    pub server_name: Option<String>,
    /// Client side: verify the server certificate.
    #[serde(default)]
    pub secure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub selector: Option<SelectorConfig>,
    pub nodes: Vec<ForwardNodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardNodeConfig {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub bypass: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

// ── Chains, hops, nodes ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    #[serde(default)]
    pub hops: Vec<HopConfig>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Several chains behind one selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainGroupConfig {
    pub chains: Vec<String>,
    #[serde(default)]
    pub selector: Option<SelectorConfig>,
}

/// A hop inside a chain. A hop with only a `name` refers to the top-level
/// hop of that name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopConfig {
    pub name: String,
    #[serde(default)]
    pub selector: Option<SelectorConfig>,
    #[serde(default)]
    pub bypass: Option<String>,
    #[serde(default)]
    pub resolver: Option<String>,
    #[serde(default)]
    pub hosts: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub file: Option<FileLoaderConfig>,
    #[serde(default)]
    pub http: Option<HttpLoaderConfig>,
    /// Loader refresh period; unset or zero loads once.
    #[serde(default, with = "duration::opt")]
    pub reload: Option<Duration>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl HopConfig {
    /// True for a bare `{name}` reference to a top-level hop.
    pub fn is_reference(&self) -> bool {
        self.nodes.is_empty() && self.file.is_none() && self.http.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileLoaderConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpLoaderConfig {
    pub url: String,
    #[serde(default, with = "duration::opt")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub bypass: Option<String>,
    #[serde(default)]
    pub resolver: Option<String>,
    #[serde(default)]
    pub hosts: Option<String>,
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub dialer: DialerConfig,
    /// Selector labels: `weight`, `backup`, `maxFails`, `failTimeout`.
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// `relay`, `tunnel` or `forward`.
    #[serde(rename = "type", default = "default_connector_type")]
    pub kind: String,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            kind: default_connector_type(),
            auth: None,
            metadata: Metadata::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialerConfig {
    /// `tcp` or `tls`.
    #[serde(rename = "type", default = "default_dialer_type")]
    pub kind: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            kind: default_dialer_type(),
            tls: None,
            metadata: Metadata::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// `round`, `rand`, `fifo` or `hash`.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_max_fails", rename = "maxFails")]
    pub max_fails: i64,
    #[serde(default, rename = "failTimeout", with = "duration::opt")]
    pub fail_timeout: Option<Duration>,
}

impl SelectorConfig {
    pub fn fail_timeout(&self) -> Duration {
        self.fail_timeout
            .filter(|d| !d.is_zero())
            .unwrap_or(Duration::from_secs(default_fail_timeout_secs()))
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            max_fails: default_max_fails(),
            fail_timeout: None,
        }
    }
}

// ── Policy objects ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutherConfig {
    pub name: String,
    #[serde(default)]
    pub auths: Vec<AuthConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassConfig {
    pub name: String,
    /// Invert matching: only listed addresses pass.
    #[serde(default)]
    pub whitelist: bool,
    /// IPs, CIDRs, hosts and `*.domain` wildcards.
    #[serde(default)]
    pub matchers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    pub name: String,
    /// Nameserver URLs (`udp://8.8.8.8`, `tls://1.1.1.1`, ...). Empty uses
    /// the system configuration.
    #[serde(default)]
    pub nameservers: Vec<String>,
    #[serde(default, rename = "preferIPv4")]
    pub prefer_ipv4: bool,
    /// Per-query timeout.
    #[serde(default, with = "duration::opt")]
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostsConfig {
    pub name: String,
    #[serde(default)]
    pub mappings: Vec<HostMappingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostMappingConfig {
    pub ip: String,
    pub hostname: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<IngressRuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressRuleConfig {
    pub hostname: String,
    /// Tunnel id; a leading `$` marks a private tunnel.
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdConfig {
    pub name: String,
    /// Only the in-process `memory` backend is built in.
    #[serde(rename = "type", default = "default_sd_type")]
    pub kind: String,
    /// Records not renewed within this period are dropped; zero keeps them.
    #[serde(default, with = "duration::opt")]
    pub ttl: Option<Duration>,
}

impl SdConfig {
    pub fn ttl(&self) -> Duration {
        self.ttl
            .unwrap_or(Duration::from_secs(default_sd_ttl_secs() * 2))
    }
}

/// Per-client byte budgets, in bytes per second. Zero means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    pub name: String,
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
}

/// Per-client request rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub name: String,
    #[serde(default = "default_rate_limit_requests")]
    pub rate: u32,
    /// Burst size; defaults to `rate`.
    #[serde(default)]
    pub burst: Option<u32>,
}

// ── Logging and metrics ──

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Base log level (trace, debug, info, warn, error).
    #[serde(default)]
    pub level: Option<String>,
    /// `pretty` (default), `compact` or `json`.
    #[serde(default)]
    pub format: Option<String>,
    /// `stderr` (default) or `stdout`.
    #[serde(default)]
    pub output: Option<String>,
    /// Per-module level overrides, e.g. `netx_chain: debug`.
    #[serde(default)]
    pub filters: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus exporter listen address.
    pub addr: String,
}

/// Global runtime knobs that are not part of any object.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeDefaults {
    pub dial_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeDefaults {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(default_dial_timeout_secs()),
            shutdown_timeout: Duration::from_secs(default_shutdown_timeout_secs()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_service_defaults() {
        let yaml = r#"
services:
  - name: relay-in
    addr: ":8420"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let svc = &cfg.services[0];
        assert_eq!(svc.handler.kind, "relay");
        assert_eq!(svc.listener.kind, "tcp");
        assert_eq!(svc.handler.retries, 0);
        assert!(svc.max_connections.is_none());
        assert!(cfg.metrics.is_none());
    }

    #[test]
    fn chain_with_inline_and_referenced_hops() {
        let yaml = r#"
hops:
  - name: shared
    nodes:
      - name: n0
        addr: 10.0.0.1:8420
chains:
  - name: c0
    hops:
      - name: shared
      - name: inline
        selector:
          strategy: rand
          maxFails: 3
          failTimeout: 30s
        nodes:
          - name: n1
            addr: 10.0.0.2:443
            dialer:
              type: tls
              tls:
                serverName: relay.example.com
            connector:
              type: tunnel
              metadata:
                tunnel.id: 6a3f1e2d-9c8b-4a7e-b5d4-c3b2a1f0e9d8
            metadata:
              weight: 2
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        let hops = &cfg.chains[0].hops;
        assert!(hops[0].is_reference());
        assert!(!hops[1].is_reference());
        let sel = hops[1].selector.as_ref().unwrap();
        assert_eq!(sel.strategy, "rand");
        assert_eq!(sel.max_fails, 3);
        assert_eq!(sel.fail_timeout(), Duration::from_secs(30));
        let node = &hops[1].nodes[0];
        assert_eq!(node.dialer.kind, "tls");
        assert_eq!(node.connector.kind, "tunnel");
        assert_eq!(node.metadata.get_int("weight"), 2);
        assert_eq!(
            node.connector.metadata.get_string("tunnel.id"),
            "6a3f1e2d-9c8b-4a7e-b5d4-c3b2a1f0e9d8"
        );
    }

    #[test]
    fn selector_defaults() {
        let sel = SelectorConfig::default();
        assert_eq!(sel.strategy, "round");
        assert_eq!(sel.max_fails, 1);
        assert_eq!(sel.fail_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn toml_document() {
        let toml_str = r#"
[[services]]
name = "tunnel"
addr = ":8421"

[services.handler]
type = "tunnel"
ingress = "ing"
sd = "local"

[services.handler.metadata]
entrypoint = ":8080"

[[ingresses]]
name = "ing"
rules = [{ hostname = "app.example.com", endpoint = "6a3f1e2d-9c8b-4a7e-b5d4-c3b2a1f0e9d8" }]

[[sds]]
name = "local"
ttl = 60

[log]
level = "debug"
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.services[0].handler.kind, "tunnel");
        assert_eq!(cfg.services[0].handler.metadata.get_string("entrypoint"), ":8080");
        assert_eq!(cfg.sds[0].ttl(), Duration::from_secs(60));
        assert_eq!(cfg.sds[0].kind, "memory");
        assert_eq!(cfg.log.level.as_deref(), Some("debug"));
    }
}
