//! Config to object graph.
//!
//! Order matters: policy objects first (authers, bypasses, resolvers,
//! hosts, ingresses, sd, limiters), then top-level hops, then chains (whose
//! bare `{name}` hops refer to top-level hops), then services.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use netx_chain::{
    BindOptions, Chain, ChainError, ChainGroup, Dialer, FileSource, Hop, HttpSource, Node,
    NodeDecoder, Router, Source, SourceLoader, Transport,
};
use netx_config::{
    Config, ForwarderConfig, HopConfig, NodeConfig, RuntimeDefaults, SelectorConfig,
    ServiceConfig, validate_node_shape,
};
use netx_core::auth::{Auther, MemoryAuther};
use netx_core::bypass::{AddrBypass, Bypass};
use netx_core::ingress::{IngressRule, StaticIngress};
use netx_core::limiter::{KeyedRateLimiter, KeyedTrafficLimiter};
use netx_core::observer::{LogObserver, Observer};
use netx_core::resolver::{HostMapper, Resolver};
use netx_core::sd::MemorySd;
use netx_core::{DEFAULT_RATE_LIMIT_CLEANUP_SECS, DEFAULT_UDP_BUFFER_SIZE, Metadata, Network};
use netx_dns::hosts::HostEntry;
use netx_dns::{DnsConfig, DnsResolver, Prefer, StaticHosts};
use netx_selector::{DefaultSelector, Selectable, StrategyKind};
use netx_transport::{Acceptor, ForwardConnector, PlainAcceptor, TcpDialer, TlsAcceptor, TlsFiles};
use serde::Deserialize;
use tracing::debug;

use crate::error::ServerError;
use crate::registry::{
    ConnectorFactory, DialerFactory, HandlerArgs, Registry, Table, lookup_factory,
};
use crate::service::{Service, ServiceListener};
use crate::util::listen_addr;

pub(crate) struct Built {
    pub registry: Registry,
    pub services: Vec<Service>,
    /// Every hop, including inline chain hops and forwarders.
    pub hops: Vec<Arc<Hop>>,
}

pub(crate) struct Builder<'a> {
    cfg: &'a Config,
    registry: Registry,
    defaults: RuntimeDefaults,
    hops: Vec<Arc<Hop>>,
}

impl<'a> Builder<'a> {
    pub fn new(cfg: &'a Config, registry: Registry) -> Self {
        Self {
            cfg,
            registry,
            defaults: RuntimeDefaults::default(),
            hops: Vec::new(),
        }
    }

    /// Limiters spawn their cleanup tasks here, so this must run inside a
    /// tokio runtime.
    pub fn build(mut self) -> Result<Built, ServerError> {
        let cfg = self.cfg;
        self.policies()?;

        let nodes = NodeBuilder::new(&self.registry, self.defaults);
        for hop in &cfg.hops {
            let built = self.hop(hop, &nodes)?;
            self.registry.hops.insert(&hop.name, built)?;
        }
        for chain in &cfg.chains {
            let mut c = Chain::new(&chain.name).with_metadata(chain.metadata.clone());
            for hop in &chain.hops {
                let hop = if hop.is_reference() {
                    self.registry.hops.get(&hop.name)?
                } else {
                    self.hop(hop, &nodes)?
                };
                c = c.with_hop(hop);
            }
            self.registry.chains.insert(&chain.name, Arc::new(c))?;
        }

        let mut services = Vec::with_capacity(cfg.services.len());
        for svc in &cfg.services {
            services.push(self.service(svc)?);
        }
        debug!(
            services = services.len(),
            hops = self.hops.len(),
            chains = self.registry.chains.len(),
            "object graph built"
        );
        Ok(Built {
            registry: self.registry,
            services,
            hops: self.hops,
        })
    }

    // ── Policies ──

    fn policies(&mut self) -> Result<(), ServerError> {
        let cfg = self.cfg;
        let r = &mut self.registry;

        for a in &cfg.authers {
            let auther = MemoryAuther::from_pairs(
                a.auths
                    .iter()
                    .map(|x| (x.username.clone(), x.password.clone())),
            );
            r.authers.insert(&a.name, Arc::new(auther))?;
        }
        for b in &cfg.bypasses {
            let bypass = AddrBypass::new(&b.matchers).whitelist(b.whitelist);
            r.bypasses.insert(&b.name, Arc::new(bypass))?;
        }
        for res in &cfg.resolvers {
            let prefer = if res.prefer_ipv4 { Prefer::Ipv4 } else { Prefer::None };
            let dns = DnsConfig::with_servers(res.nameservers.clone())
                .with_prefer(prefer)
                .with_timeout(res.timeout);
            r.resolvers.insert(&res.name, Arc::new(DnsResolver::new(&dns)?))?;
        }
        for h in &cfg.hosts {
            let mut entries = Vec::with_capacity(h.mappings.len());
            for m in &h.mappings {
                let ip = m.ip.parse::<IpAddr>().map_err(|_| {
                    ServerError::Build(format!("hosts {}: invalid ip {}", h.name, m.ip))
                })?;
                entries.push(HostEntry {
                    ip,
                    hostname: m.hostname.clone(),
                    aliases: m.aliases.clone(),
                });
            }
            r.hosts.insert(&h.name, Arc::new(StaticHosts::new(entries)))?;
        }
        for i in &cfg.ingresses {
            let rules = i
                .rules
                .iter()
                .map(|rule| IngressRule::new(&rule.hostname, &rule.endpoint));
            r.ingresses
                .insert(&i.name, Arc::new(StaticIngress::with_rules(rules)))?;
        }
        for sd in &cfg.sds {
            if sd.kind != "memory" {
                return Err(ServerError::UnknownType {
                    kind: "sd",
                    name: sd.kind.clone(),
                });
            }
            r.sds.insert(&sd.name, Arc::new(MemorySd::new(sd.ttl())))?;
        }

        let cleanup = Duration::from_secs(DEFAULT_RATE_LIMIT_CLEANUP_SECS);
        for l in &cfg.limiters {
            let limiter = KeyedTrafficLimiter::new(l.input, l.output);
            limiter.start_cleanup_task(cleanup);
            r.limiters.insert(&l.name, Arc::new(limiter))?;
        }
        for l in &cfg.rlimiters {
            let rate = u64::from(l.rate);
            let limiter = KeyedRateLimiter::new(rate, l.burst.map_or(rate, u64::from));
            limiter.start_cleanup_task(cleanup);
            r.rlimiters.insert(&l.name, Arc::new(limiter))?;
        }
        Ok(())
    }

    // ── Hops ──

    fn hop(&mut self, cfg: &HopConfig, nodes: &NodeBuilder) -> Result<Arc<Hop>, ServerError> {
        let scope = NodeScope {
            resolver: self.registry.resolvers.lookup(cfg.resolver.as_ref())?,
            hosts: self.registry.hosts.lookup(cfg.hosts.as_ref())?,
        };
        let list = cfg
            .nodes
            .iter()
            .map(|n| nodes.build(n, &scope))
            .collect::<Result<Vec<_>, _>>()?;

        let mut hop = Hop::new(&cfg.name, list).with_selector(selector(cfg.selector.as_ref())?);
        if let Some(b) = self.registry.bypasses.lookup(cfg.bypass.as_ref())? {
            hop = hop.with_bypass(b);
        }

        let mut sources: Vec<Arc<dyn Source>> = Vec::new();
        if let Some(f) = &cfg.file {
            sources.push(Arc::new(FileSource::new(&f.path)));
        }
        if let Some(h) = &cfg.http {
            sources.push(Arc::new(HttpSource::new(&h.url, h.timeout)?));
        }
        if !sources.is_empty() {
            let loader = SourceLoader::new(sources, nodes.decoder(scope));
            hop = hop.with_loader(Arc::new(loader), cfg.reload.unwrap_or_default());
        }

        let hop = Arc::new(hop);
        self.hops.push(hop.clone());
        Ok(hop)
    }

    /// Static targets of a service. Nodes dial plain TCP and terminate at
    /// their own address.
    fn forwarder(
        &mut self,
        svc: &ServiceConfig,
        f: &ForwarderConfig,
    ) -> Result<Arc<Hop>, ServerError> {
        let dialer: Arc<dyn Dialer> =
            Arc::new(TcpDialer::new().with_timeout(self.defaults.dial_timeout));
        let mut nodes = Vec::with_capacity(f.nodes.len());
        for n in &f.nodes {
            let transport = Transport::new(dialer.clone(), Arc::new(ForwardConnector));
            let mut node = Node::new(&n.name, &n.addr, transport).with_metadata(n.metadata.clone());
            if let Some(b) = self.registry.bypasses.lookup(n.bypass.as_ref())? {
                node = node.with_bypass(b);
            }
            nodes.push(Arc::new(node));
        }
        let name = f.name.clone().unwrap_or_else(|| svc.name.clone());
        let hop = Arc::new(Hop::new(name, nodes).with_selector(selector(f.selector.as_ref())?));
        self.hops.push(hop.clone());
        Ok(hop)
    }

    // ── Services ──

    fn router(&self, svc: &ServiceConfig) -> Result<Arc<Router>, ServerError> {
        let h = &svc.handler;
        let mut router = Router::new()
            .with_retries(h.retries)
            .with_timeout(self.defaults.dial_timeout);
        if let Some(name) = &h.chain {
            router = router.with_chain(self.registry.chains.get(name)?);
        } else if let Some(group) = &h.chain_group {
            let chains = group
                .chains
                .iter()
                .map(|n| self.registry.chains.get(n))
                .collect::<Result<Vec<_>, _>>()?;
            let group =
                ChainGroup::new(&svc.name, chains).with_selector(selector(group.selector.as_ref())?);
            router = router.with_chain(Arc::new(group));
        }
        if let Some(r) = self.registry.resolvers.lookup(svc.resolver.as_ref())? {
            router = router.with_resolver(r);
        }
        if let Some(h) = self.registry.hosts.lookup(svc.hosts.as_ref())? {
            router = router.with_host_mapper(h);
        }
        Ok(Arc::new(router))
    }

    fn listener(&self, svc: &ServiceConfig, network: Network) -> Result<ServiceListener, ServerError> {
        let l = &svc.listener;
        match l.kind.as_str() {
            "tcp" | "tls" => {
                let addr = listen_addr(&svc.addr)?;
                let acceptor: Arc<dyn Acceptor> = if l.kind == "tls" {
                    let files = l.tls.as_ref().and_then(|t| {
                        Some(TlsFiles {
                            cert: t.cert_file.clone()?,
                            key: t.key_file.clone()?,
                        })
                    });
                    Arc::new(TlsAcceptor::new(files.as_ref())?)
                } else {
                    Arc::new(PlainAcceptor)
                };
                Ok(ServiceListener::Tcp { addr, acceptor })
            }
            "rtcp" | "rudp" => {
                let mut router = Router::new().with_timeout(self.defaults.dial_timeout);
                if let Some(name) = &l.chain {
                    router = router.with_chain(self.registry.chains.get(name)?);
                }
                let addr = match svc.addr.strip_prefix(':') {
                    Some(port) => format!("0.0.0.0:{port}"),
                    None => svc.addr.clone(),
                };
                Ok(ServiceListener::Reverse {
                    router: Arc::new(router),
                    network,
                    addr,
                    opts: bind_options(&l.metadata),
                })
            }
            other => Err(ServerError::UnknownType {
                kind: "listener",
                name: other.to_string(),
            }),
        }
    }

    fn service(&mut self, svc: &ServiceConfig) -> Result<Service, ServerError> {
        let network = if svc.listener.kind == "rudp" {
            Network::Udp
        } else {
            Network::Tcp
        };
        let forwarder = match &svc.forwarder {
            Some(f) => Some(self.forwarder(svc, f)?),
            None => None,
        };

        let h = &svc.handler;
        let auther: Option<Arc<dyn Auther>> = match (&h.auther, &h.auth) {
            (Some(name), _) => Some(self.registry.authers.get(name)?),
            (None, Some(a)) => Some(Arc::new(MemoryAuther::from_pairs([(
                a.username.clone(),
                a.password.clone(),
            )]))),
            (None, None) => None,
        };
        let args = HandlerArgs {
            service: svc,
            router: self.router(svc)?,
            forwarder,
            network,
            auther,
            bypass: self.registry.bypasses.lookup(svc.bypass.as_ref())?,
            rate_limiter: self.registry.rlimiters.lookup(svc.rlimiter.as_ref())?,
            traffic_limiter: self.registry.limiters.lookup(svc.limiter.as_ref())?,
            ingress: self.registry.ingresses.lookup(h.ingress.as_ref())?,
            sd: self.registry.sds.lookup(h.sd.as_ref())?,
            observer: observer(&h.metadata)?,
        };
        let handler = self.registry.handler(&h.kind)?(args)?;
        let listener = self.listener(svc, network)?;
        debug!(service = %svc.name, handler = %h.kind, listener = %svc.listener.kind, "service built");

        Ok(Service::new(&svc.name, listener, handler)
            .with_max_connections(svc.max_connections)
            .with_shutdown_timeout(self.defaults.shutdown_timeout))
    }
}

fn selector<T: Selectable + Clone + 'static>(
    cfg: Option<&SelectorConfig>,
) -> Result<Arc<DefaultSelector<T>>, ServerError> {
    let cfg = cfg.cloned().unwrap_or_default();
    let kind = cfg
        .strategy
        .parse::<StrategyKind>()
        .map_err(|e| ServerError::Build(e.to_string()))?;
    Ok(Arc::new(DefaultSelector::standard(
        kind,
        cfg.max_fails,
        cfg.fail_timeout(),
    )))
}

/// `observer: log` pushes handler stats to the log.
fn observer(md: &Metadata) -> Result<Option<Arc<dyn Observer>>, ServerError> {
    match md.get_string("observer").as_str() {
        "" => Ok(None),
        "log" => Ok(Some(Arc::new(LogObserver))),
        other => Err(ServerError::UnknownType {
            kind: "observer",
            name: other.to_string(),
        }),
    }
}

fn bind_options(md: &Metadata) -> BindOptions {
    let mut opts = BindOptions {
        mux: md.get_bool("mux"),
        ..Default::default()
    };
    if let n @ 1.. = md.get_int("backlog") {
        opts.backlog = n as usize;
    }
    let ttl = md.get_duration("ttl");
    if !ttl.is_zero() {
        opts.udp_conn_ttl = ttl;
    }
    opts.udp_buffer_size = match md.get_int("udpBufferSize") {
        n if n > 0 => n as usize,
        _ => DEFAULT_UDP_BUFFER_SIZE,
    };
    opts
}

// ── Nodes ──

/// Hop-level defaults a node falls back to.
#[derive(Clone, Default)]
pub(crate) struct NodeScope {
    resolver: Option<Arc<dyn Resolver>>,
    hosts: Option<Arc<dyn HostMapper>>,
}

/// Owns what it needs to build nodes, so hop loaders can keep building them
/// after the registry has moved on.
#[derive(Clone)]
pub(crate) struct NodeBuilder {
    dialers: BTreeMap<String, DialerFactory>,
    connectors: BTreeMap<String, ConnectorFactory>,
    bypasses: Table<dyn Bypass>,
    resolvers: Table<dyn Resolver>,
    hosts: Table<dyn HostMapper>,
    defaults: RuntimeDefaults,
}

/// A loaded node document: a bare list or `{nodes: [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum NodeList {
    List(Vec<NodeConfig>),
    Wrapped { nodes: Vec<NodeConfig> },
}

impl NodeBuilder {
    pub fn new(registry: &Registry, defaults: RuntimeDefaults) -> Self {
        Self {
            dialers: registry.dialer_table(),
            connectors: registry.connector_table(),
            bypasses: registry.bypasses.clone(),
            resolvers: registry.resolvers.clone(),
            hosts: registry.hosts.clone(),
            defaults,
        }
    }

    pub fn build(&self, cfg: &NodeConfig, scope: &NodeScope) -> Result<Arc<Node>, ServerError> {
        let dialer = lookup_factory(&self.dialers, "dialer", &cfg.dialer.kind)?(cfg, &self.defaults)?;
        let connector =
            lookup_factory(&self.connectors, "connector", &cfg.connector.kind)?(&cfg.connector)?;

        let mut node = Node::new(&cfg.name, &cfg.addr, Transport::new(dialer, connector))
            .with_metadata(cfg.metadata.clone());
        if let Some(b) = self.bypasses.lookup(cfg.bypass.as_ref())? {
            node = node.with_bypass(b);
        }
        if let Some(r) = self
            .resolvers
            .lookup(cfg.resolver.as_ref())?
            .or_else(|| scope.resolver.clone())
        {
            node = node.with_resolver(r);
        }
        if let Some(h) = self
            .hosts
            .lookup(cfg.hosts.as_ref())?
            .or_else(|| scope.hosts.clone())
        {
            node = node.with_host_mapper(h);
        }
        Ok(Arc::new(node))
    }

    /// Decoder for hop loaders: YAML or JSON node documents.
    pub fn decoder(&self, scope: NodeScope) -> NodeDecoder {
        let this = self.clone();
        Arc::new(move |raw: &[u8]| -> Result<Vec<Arc<Node>>, ChainError> {
            let list = match serde_yaml::from_slice::<NodeList>(raw) {
                Ok(NodeList::List(v)) | Ok(NodeList::Wrapped { nodes: v }) => v,
                Err(e) => return Err(ChainError::Load(format!("decode nodes: {e}"))),
            };
            list.iter()
                .map(|n| {
                    validate_node_shape(n, &format!("node {}", n.name))
                        .map_err(|e| ChainError::Load(e.to_string()))?;
                    this.build(n, &scope)
                        .map_err(|e| ChainError::Load(e.to_string()))
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use netx_chain::Chainer;
    use netx_config::parse_config;

    use super::*;

    fn build(yaml: &str) -> Result<Built, ServerError> {
        let cfg = parse_config(yaml, "yaml").unwrap();
        Builder::new(&cfg, Registry::with_defaults()).build()
    }

    const FULL: &str = r#"
services:
  - name: relay-in
    addr: "127.0.0.1:0"
    bypass: lan
    rlimiter: per-ip
    limiter: slow
    handler:
      type: relay
      chain: out
      auther: users
      metadata:
        observer: log
  - name: tunnel-in
    addr: "127.0.0.1:0"
    handler:
      type: tunnel
      ingress: public
      sd: local
      metadata:
        node: node-a
  - name: fwd
    addr: "127.0.0.1:0"
    handler:
      type: forward
    forwarder:
      selector: {strategy: fifo}
      nodes:
        - {name: t0, addr: "127.0.0.1:9000"}
        - {name: t1, addr: "127.0.0.1:9001"}
hops:
  - name: edge
    selector: {strategy: rand, maxFails: 2, failTimeout: 5s}
    hosts: static
    nodes:
      - name: e0
        addr: edge.example.com:8420
        connector: {type: relay, auth: {username: u, password: p}}
        dialer: {type: tls, tls: {serverName: edge.example.com}}
chains:
  - name: out
    hops:
      - name: edge
      - name: exit
        nodes:
          - {name: x0, addr: "10.0.0.9:8420"}
authers:
  - name: users
    auths: [{username: alice, password: secret}]
bypasses:
  - name: lan
    matchers: ["10.0.0.0/8", "*.internal"]
hosts:
  - name: static
    mappings: [{ip: 192.0.2.10, hostname: edge.example.com}]
ingresses:
  - name: public
    rules: [{hostname: app.example.com, endpoint: 4d21094e-b74c-4916-86c1-d9fa36ea677b}]
sds:
  - name: local
limiters:
  - {name: slow, input: 65536, output: 65536}
rlimiters:
  - {name: per-ip, rate: 10}
"#;

    #[tokio::test]
    async fn builds_full_graph() {
        let built = build(FULL).unwrap();
        let r = &built.registry;
        assert_eq!(built.services.len(), 3);
        assert_eq!(r.authers.len(), 1);
        assert_eq!(r.hops.names().collect::<Vec<_>>(), ["edge"]);
        // edge, the inline exit hop and the forwarder
        assert_eq!(built.hops.len(), 3);

        let chain = r.chains.get("out").unwrap();
        assert_eq!(chain.name(), "out");
        let ctx = netx_core::RequestCtx::new();
        let route = chain.route(&ctx, Network::Tcp, "example.org:443").unwrap();
        let names: Vec<_> = route.nodes().iter().map(|n| n.name.clone()).collect();
        assert_eq!(names, ["e0", "x0"]);

        assert!(matches!(
            built.services[2].listener(),
            ServiceListener::Tcp { .. }
        ));
    }

    #[tokio::test]
    async fn referenced_hop_is_shared() {
        let built = build(FULL).unwrap();
        let top = built.registry.hops.get("edge").unwrap();
        assert!(built.hops.iter().filter(|h| Arc::ptr_eq(h, &top)).count() == 1);
    }

    #[tokio::test]
    async fn missing_reference_is_not_found() {
        let err = build(
            r#"
services:
  - name: s
    addr: ":0"
    handler: {chain: nowhere}
"#,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ServerError::NotFound { kind: "chain", .. }));
    }

    #[tokio::test]
    async fn unknown_types_are_rejected() {
        let err = build("services: [{name: s, addr: \":0\", handler: {type: socks5}}]")
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::UnknownType { kind: "handler", .. }));

        let err = build(
            "hops: [{name: h, nodes: [{name: n, addr: \"1.2.3.4:1\", dialer: {type: quic}}]}]",
        )
        .err()
        .unwrap();
        assert!(matches!(err, ServerError::UnknownType { kind: "dialer", .. }));
    }

    #[tokio::test]
    async fn forward_handler_without_forwarder_fails() {
        let err = build("services: [{name: s, addr: \":0\", handler: {type: forward}}]")
            .err()
            .unwrap();
        assert!(matches!(err, ServerError::Build(_)));
    }

    #[tokio::test]
    async fn reverse_listener_uses_listener_chain() {
        let built = build(
            r#"
services:
  - name: rev
    addr: ":8080"
    handler: {type: forward}
    forwarder:
      nodes: [{name: local, addr: "127.0.0.1:80"}]
    listener:
      type: rtcp
      chain: up
chains:
  - name: up
    hops:
      - name: h
        nodes: [{name: r, addr: "198.51.100.1:8420"}]
"#,
        )
        .unwrap();
        match built.services[0].listener() {
            ServiceListener::Reverse {
                router,
                network,
                addr,
                ..
            } => {
                assert_eq!(*network, Network::Tcp);
                assert_eq!(addr, "0.0.0.0:8080");
                assert!(router.chain().is_some());
            }
            other => panic!("unexpected listener {other:?}"),
        }
    }

    #[tokio::test]
    async fn decoder_accepts_list_and_wrapped_documents() {
        let registry = Registry::with_defaults();
        let decode = NodeBuilder::new(&registry, RuntimeDefaults::default()).decoder(NodeScope::default());

        let nodes = decode(b"- {name: a, addr: \"10.0.0.1:1\"}\n- {name: b, addr: \"10.0.0.2:1\"}\n").unwrap();
        assert_eq!(nodes.len(), 2);

        let nodes = decode(br#"{"nodes": [{"name": "c", "addr": "10.0.0.3:1"}]}"#).unwrap();
        assert_eq!(nodes[0].name, "c");

        let err = decode(b"- {name: d, addr: \"10.0.0.4:1\", connector: {type: socks}}").err().unwrap();
        assert!(matches!(err, ChainError::Load(_)));
    }

    #[tokio::test]
    async fn file_loader_merges_with_static_nodes() {
        let mut f = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        f.write_all(b"- {name: loaded, addr: \"10.0.0.5:8420\"}\n").unwrap();
        let yaml = format!(
            r#"
hops:
  - name: h
    nodes: [{{name: fixed, addr: "10.0.0.4:8420"}}]
    file: {{path: "{}"}}
"#,
            f.path().display()
        );
        let built = build(&yaml).unwrap();
        let hop = built.registry.hops.get("h").unwrap();
        assert_eq!(hop.nodes().len(), 1);
        assert_eq!(hop.reload().await.unwrap(), 2);
        assert!(hop.node("loaded").is_some());
    }
}
