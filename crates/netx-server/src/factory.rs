//! Built-in factories registered by [`Registry::with_defaults`](crate::Registry::with_defaults).

use std::sync::Arc;
use std::time::Duration;

use netx_chain::{Connector, Dialer};
use netx_config::{ConnectorConfig, NodeConfig, RuntimeDefaults};
use netx_core::net::host_of;
use netx_core::{DEFAULT_TCP_NO_DELAY, Metadata};
use netx_relay::{
    ConnectorOptions, ForwardHandler, ForwardOptions, Handler, RelayConnector, RelayHandler,
    RelayOptions, TunnelConnector, TunnelHandler, TunnelOptions,
};
use netx_transport::{ForwardConnector, TcpDialer, TlsDialer};

use crate::error::ServerError;
use crate::registry::HandlerArgs;

// ── Dialers ──

fn nodelay(md: &Metadata) -> bool {
    if md.contains("nodelay") {
        md.get_bool("nodelay")
    } else {
        DEFAULT_TCP_NO_DELAY
    }
}

fn dial_timeout(md: &Metadata, defaults: &RuntimeDefaults) -> Duration {
    match md.get_duration("timeout") {
        d if d.is_zero() => defaults.dial_timeout,
        d => d,
    }
}

pub(crate) fn tcp_dialer(
    node: &NodeConfig,
    defaults: &RuntimeDefaults,
) -> Result<Arc<dyn Dialer>, ServerError> {
    let md = &node.dialer.metadata;
    Ok(Arc::new(
        TcpDialer::new()
            .with_nodelay(nodelay(md))
            .with_timeout(dial_timeout(md, defaults)),
    ))
}

/// SNI defaults to the node host; certificate checks only with `secure`.
pub(crate) fn tls_dialer(
    node: &NodeConfig,
    defaults: &RuntimeDefaults,
) -> Result<Arc<dyn Dialer>, ServerError> {
    let md = &node.dialer.metadata;
    let tls = node.dialer.tls.clone().unwrap_or_default();
    let sni = tls
        .server_name
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| host_of(&node.addr).to_string());
    let dialer = if tls.secure {
        TlsDialer::new(sni)
    } else {
        TlsDialer::new_insecure(sni)
    };
    Ok(Arc::new(
        dialer
            .with_nodelay(nodelay(md))
            .with_timeout(dial_timeout(md, defaults)),
    ))
}

// ── Connectors ──

pub(crate) fn relay_connector(cfg: &ConnectorConfig) -> Result<Arc<dyn Connector>, ServerError> {
    let mut c = RelayConnector::new(ConnectorOptions::from_metadata(&cfg.metadata));
    if let Some(auth) = &cfg.auth {
        c = c.with_auth(&auth.username, &auth.password);
    }
    Ok(Arc::new(c))
}

pub(crate) fn tunnel_connector(cfg: &ConnectorConfig) -> Result<Arc<dyn Connector>, ServerError> {
    let mut c = TunnelConnector::from_metadata(&cfg.metadata)?;
    if let Some(auth) = &cfg.auth {
        c = c.with_auth(&auth.username, &auth.password);
    }
    Ok(Arc::new(c))
}

pub(crate) fn forward_connector(_cfg: &ConnectorConfig) -> Result<Arc<dyn Connector>, ServerError> {
    Ok(Arc::new(ForwardConnector))
}

// ── Handlers ──

pub(crate) fn relay_handler(args: HandlerArgs<'_>) -> Result<Arc<dyn Handler>, ServerError> {
    let svc = args.service;
    let mut h = RelayHandler::new(
        &svc.name,
        args.router,
        RelayOptions::from_metadata(&svc.handler.metadata),
    );
    if let Some(hop) = args.forwarder {
        h = h.with_hop(hop);
    }
    if let Some(a) = args.auther {
        h = h.with_auther(a);
    }
    if let Some(b) = args.bypass {
        h = h.with_bypass(b);
    }
    if let Some(l) = args.rate_limiter {
        h = h.with_rate_limiter(l);
    }
    if let Some(l) = args.traffic_limiter {
        h = h.with_traffic_limiter(l);
    }
    if let Some(o) = args.observer {
        h = h.with_observer(o);
    }
    Ok(Arc::new(h))
}

/// `metadata.node` pins the node id advertised to service discovery.
pub(crate) fn tunnel_handler(args: HandlerArgs<'_>) -> Result<Arc<dyn Handler>, ServerError> {
    let svc = args.service;
    let md = &svc.handler.metadata;
    let mut h = TunnelHandler::new(&svc.name, TunnelOptions::from_metadata(md));
    let node = md.get_string("node");
    if !node.is_empty() {
        h = h.with_node_id(node);
    }
    if let Some(i) = args.ingress {
        h = h.with_ingress(i);
    }
    if let Some(sd) = args.sd {
        h = h.with_sd(sd);
    }
    if let Some(a) = args.auther {
        h = h.with_auther(a);
    }
    if let Some(b) = args.bypass {
        h = h.with_bypass(b);
    }
    if let Some(l) = args.rate_limiter {
        h = h.with_rate_limiter(l);
    }
    if let Some(l) = args.traffic_limiter {
        h = h.with_traffic_limiter(l);
    }
    if let Some(o) = args.observer {
        h = h.with_observer(o);
    }
    Ok(Arc::new(h))
}

pub(crate) fn forward_handler(args: HandlerArgs<'_>) -> Result<Arc<dyn Handler>, ServerError> {
    let svc = args.service;
    let hop = args.forwarder.ok_or_else(|| {
        ServerError::Build(format!("service {}: forward handler needs a forwarder", svc.name))
    })?;
    let mut h = ForwardHandler::new(
        &svc.name,
        args.network,
        args.router,
        hop,
        ForwardOptions::from_metadata(&svc.handler.metadata),
    );
    if let Some(b) = args.bypass {
        h = h.with_bypass(b);
    }
    if let Some(l) = args.rate_limiter {
        h = h.with_rate_limiter(l);
    }
    if let Some(l) = args.traffic_limiter {
        h = h.with_traffic_limiter(l);
    }
    if let Some(o) = args.observer {
        h = h.with_observer(o);
    }
    Ok(Arc::new(h))
}
