//! Explicit object registry.
//!
//! One [`Registry`] is built at startup and handed to the builder. It holds
//! two kinds of tables:
//!
//! - factory tables keyed by the `type` string of a config section
//!   (dialers, connectors, handlers), and
//! - named-object tables filled from the top-level config sections
//!   (authers, bypasses, resolvers, hosts, ingresses, service discovery,
//!   limiters, hops, chains) so services and nodes can refer to them by name.
//!
//! Nothing here is process-global; tests build their own registries.

use std::collections::BTreeMap;
use std::sync::Arc;

use netx_chain::{Chainer, Connector, Dialer, Hop, Router};
use netx_config::{ConnectorConfig, NodeConfig, RuntimeDefaults, ServiceConfig};
use netx_core::Network;
use netx_core::auth::Auther;
use netx_core::bypass::Bypass;
use netx_core::ingress::Ingress;
use netx_core::limiter::{RateLimiter, TrafficLimiter};
use netx_core::observer::Observer;
use netx_core::resolver::{HostMapper, Resolver};
use netx_core::sd::ServiceDiscovery;
use netx_relay::Handler;

use crate::error::ServerError;
use crate::factory;

/// Builds the dialer of a chain node.
pub type DialerFactory =
    fn(&NodeConfig, &RuntimeDefaults) -> Result<Arc<dyn Dialer>, ServerError>;
/// Builds the connector of a chain node.
pub type ConnectorFactory = fn(&ConnectorConfig) -> Result<Arc<dyn Connector>, ServerError>;
/// Builds the handler of a service.
pub type HandlerFactory = fn(HandlerArgs<'_>) -> Result<Arc<dyn Handler>, ServerError>;

/// Everything a handler factory may wire into its handler.
pub struct HandlerArgs<'a> {
    pub service: &'a ServiceConfig,
    pub router: Arc<Router>,
    /// Static targets from the service `forwarder`.
    pub forwarder: Option<Arc<Hop>>,
    /// `udp` for `rudp` listeners, `tcp` otherwise.
    pub network: Network,
    pub auther: Option<Arc<dyn Auther>>,
    pub bypass: Option<Arc<dyn Bypass>>,
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub traffic_limiter: Option<Arc<dyn TrafficLimiter>>,
    pub ingress: Option<Arc<dyn Ingress>>,
    pub sd: Option<Arc<dyn ServiceDiscovery>>,
    pub observer: Option<Arc<dyn Observer>>,
}

/// Named objects of one kind.
pub struct Table<T: ?Sized> {
    kind: &'static str,
    items: BTreeMap<String, Arc<T>>,
}

impl<T: ?Sized> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            items: self.items.clone(),
        }
    }
}

impl<T: ?Sized> Table<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            items: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, item: Arc<T>) -> Result<(), ServerError> {
        let name = name.into();
        if self.items.contains_key(&name) {
            return Err(ServerError::Build(format!("duplicate {} {name}", self.kind)));
        }
        self.items.insert(name, item);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<T>, ServerError> {
        self.items
            .get(name)
            .cloned()
            .ok_or_else(|| ServerError::NotFound {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    /// Resolve an optional reference.
    pub fn lookup(&self, name: Option<&String>) -> Result<Option<Arc<T>>, ServerError> {
        name.map(|n| self.get(n)).transpose()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Arc<T>> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct Registry {
    dialers: BTreeMap<String, DialerFactory>,
    connectors: BTreeMap<String, ConnectorFactory>,
    handlers: BTreeMap<String, HandlerFactory>,

    pub authers: Table<dyn Auther>,
    pub bypasses: Table<dyn Bypass>,
    pub resolvers: Table<dyn Resolver>,
    pub hosts: Table<dyn HostMapper>,
    pub ingresses: Table<dyn Ingress>,
    pub sds: Table<dyn ServiceDiscovery>,
    pub limiters: Table<dyn TrafficLimiter>,
    pub rlimiters: Table<dyn RateLimiter>,
    pub hops: Table<Hop>,
    pub chains: Table<dyn Chainer>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty registry without any factories.
    pub fn new() -> Self {
        Self {
            dialers: BTreeMap::new(),
            connectors: BTreeMap::new(),
            handlers: BTreeMap::new(),
            authers: Table::new("auther"),
            bypasses: Table::new("bypass"),
            resolvers: Table::new("resolver"),
            hosts: Table::new("hosts"),
            ingresses: Table::new("ingress"),
            sds: Table::new("sd"),
            limiters: Table::new("limiter"),
            rlimiters: Table::new("rlimiter"),
            hops: Table::new("hop"),
            chains: Table::new("chain"),
        }
    }

    /// Registry with the built-in `tcp`/`tls` dialers, `relay`/`tunnel`/
    /// `forward` connectors and `relay`/`tunnel`/`forward` handlers.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register_dialer("tcp", factory::tcp_dialer);
        r.register_dialer("tls", factory::tls_dialer);
        r.register_connector("relay", factory::relay_connector);
        r.register_connector("tunnel", factory::tunnel_connector);
        r.register_connector("forward", factory::forward_connector);
        r.register_handler("relay", factory::relay_handler);
        r.register_handler("tunnel", factory::tunnel_handler);
        r.register_handler("forward", factory::forward_handler);
        r
    }

    pub fn register_dialer(&mut self, kind: impl Into<String>, f: DialerFactory) {
        self.dialers.insert(kind.into(), f);
    }

    pub fn register_connector(&mut self, kind: impl Into<String>, f: ConnectorFactory) {
        self.connectors.insert(kind.into(), f);
    }

    pub fn register_handler(&mut self, kind: impl Into<String>, f: HandlerFactory) {
        self.handlers.insert(kind.into(), f);
    }

    pub fn dialer(&self, kind: &str) -> Result<DialerFactory, ServerError> {
        lookup_factory(&self.dialers, "dialer", kind)
    }

    pub fn connector(&self, kind: &str) -> Result<ConnectorFactory, ServerError> {
        lookup_factory(&self.connectors, "connector", kind)
    }

    pub fn handler(&self, kind: &str) -> Result<HandlerFactory, ServerError> {
        lookup_factory(&self.handlers, "handler", kind)
    }

    pub(crate) fn dialer_table(&self) -> BTreeMap<String, DialerFactory> {
        self.dialers.clone()
    }

    pub(crate) fn connector_table(&self) -> BTreeMap<String, ConnectorFactory> {
        self.connectors.clone()
    }
}

pub(crate) fn lookup_factory<F: Copy>(
    table: &BTreeMap<String, F>,
    kind: &'static str,
    name: &str,
) -> Result<F, ServerError> {
    table
        .get(name)
        .copied()
        .ok_or_else(|| ServerError::UnknownType {
            kind,
            name: name.to_string(),
        })
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("dialers", &self.dialers.keys().collect::<Vec<_>>())
            .field("connectors", &self.connectors.keys().collect::<Vec<_>>())
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("hops", &self.hops.names().collect::<Vec<_>>())
            .field("chains", &self.chains.names().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
