//! Tunnel relay: clients BIND a tunnel id to publish a mux session, and
//! CONNECT requests (or the public entrypoint) are dispatched onto those
//! sessions, locally or through the node that holds them.

mod bind;
mod connect;
mod connector;
mod dialer;
mod entrypoint;
mod pool;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netx_core::auth::Auther;
use netx_core::bypass::Bypass;
use netx_core::ingress::{Ingress, IngressRule, StaticIngress};
use netx_core::io::TransportOptions;
use netx_core::limiter::{RateLimiter, TrafficLimiter};
use netx_core::observer::{HandlerStats, Observer};
use netx_core::sd::ServiceDiscovery;
use netx_core::{
    Conn, DEFAULT_ENTRYPOINT_MAX_HEADER_BYTES, DEFAULT_OBSERVE_PERIOD_SECS,
    DEFAULT_RELAY_BUFFER_SIZE, DEFAULT_TUNNEL_TTL_SECS, Metadata, Network, RequestCtx,
};
use netx_metrics::{
    record_connection_rejected, record_handler_error, record_request_finished,
    record_request_started,
};
use netx_proto::{CMD_BIND, CMD_CONNECT, Features, Request, Status, TunnelId};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

pub use connector::TunnelConnector;
pub use dialer::{Dialed, TunnelDialer};
pub use entrypoint::Entrypoint;
pub use pool::{Connector, ConnectorPool, MAX_WEIGHT};

use crate::error::RelayError;
use crate::handler::{Handler, allow, read_header, reply, spawn_observer};
use crate::mux::MuxConfig;
use crate::pipe::Pipe;

/// Text form used in ingress rules; keeps the `$` of private ids.
pub(crate) fn rule_endpoint(tid: &TunnelId) -> String {
    if tid.is_private() {
        format!("${tid}")
    } else {
        tid.to_string()
    }
}

/// Parse `"host:tunnel-id"` pairs; malformed entries are skipped.
fn parse_rules(entries: &[String]) -> Vec<IngressRule> {
    entries
        .iter()
        .filter_map(|s| {
            let (host, endpoint) = s.split_once(':')?;
            let (host, endpoint) = (host.trim(), endpoint.trim());
            (!host.is_empty() && !endpoint.is_empty()).then(|| IngressRule::new(host, endpoint))
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub read_timeout: Option<Duration>,
    /// Connector lease; renewed while the session lives.
    pub ttl: Duration,
    /// Skip the ingress check on CONNECT.
    pub direct: bool,
    /// Public entrypoint listen address, also advertised to service
    /// discovery as this node's address.
    pub entrypoint: String,
    /// CONNECT requests carrying this id are handed to the entrypoint.
    pub entrypoint_id: Option<TunnelId>,
    /// Static ingress rules from the `tunnel` key.
    pub rules: Vec<IngressRule>,
    pub mux: MuxConfig,
    pub observe_period: Duration,
    pub transport: TransportOptions,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            read_timeout: None,
            ttl: Duration::from_secs(DEFAULT_TUNNEL_TTL_SECS),
            direct: false,
            entrypoint: String::new(),
            entrypoint_id: None,
            rules: Vec::new(),
            mux: MuxConfig::default(),
            observe_period: Duration::from_secs(DEFAULT_OBSERVE_PERIOD_SECS),
            transport: TransportOptions::default(),
        }
    }
}

impl TunnelOptions {
    pub fn from_metadata(md: &Metadata) -> Self {
        let read_timeout = md.get_duration("readTimeout");
        let ttl = match md.get_duration("tunnel.ttl") {
            d if d.is_zero() => Duration::from_secs(DEFAULT_TUNNEL_TTL_SECS),
            d => d,
        };
        let observe_period = match md.get_duration("observePeriod") {
            d if d < Duration::from_millis(1) => Duration::from_secs(DEFAULT_OBSERVE_PERIOD_SECS),
            d => d,
        };
        let buffer_size = match md.get_int("bufferSize") {
            n if n > 0 => n as usize,
            _ => DEFAULT_RELAY_BUFFER_SIZE,
        };
        let idle = md.get_duration("idleTimeout");
        let entrypoint_id = md
            .get_string("entrypoint.id")
            .parse::<TunnelId>()
            .ok()
            .filter(|t| !t.is_zero());

        Self {
            read_timeout: (!read_timeout.is_zero()).then_some(read_timeout),
            ttl,
            direct: md.get_bool("tunnel.direct"),
            entrypoint: md.get_string("entrypoint"),
            entrypoint_id,
            rules: parse_rules(&md.get_strings("tunnel")),
            mux: MuxConfig::from_metadata(md),
            observe_period,
            transport: TransportOptions {
                buffer_size,
                idle_timeout: (!idle.is_zero()).then_some(idle),
            },
        }
    }
}

/// Fields of a tunnel request.
pub(crate) struct TunnelRequest {
    pub req: Request,
    pub network: Network,
    /// First address feature.
    pub src: String,
    /// Second address feature.
    pub dst: String,
    pub tunnel: TunnelId,
    /// Weight carried by BIND requests.
    pub weight: u8,
    pub ctx: RequestCtx,
}

pub struct TunnelHandler {
    service: String,
    node: String,
    pool: Arc<ConnectorPool>,
    ingress: Option<Arc<dyn Ingress>>,
    sd: Option<Arc<dyn ServiceDiscovery>>,
    auther: Option<Arc<dyn Auther>>,
    bypass: Option<Arc<dyn Bypass>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    traffic_limiter: Option<Arc<dyn TrafficLimiter>>,
    observer: Option<Arc<dyn Observer>>,
    stats: Arc<HandlerStats>,
    opts: TunnelOptions,
}

impl TunnelHandler {
    pub fn new(service: impl Into<String>, opts: TunnelOptions) -> Self {
        let service = service.into();
        let ingress = (!opts.rules.is_empty()).then(|| {
            Arc::new(StaticIngress::with_rules(opts.rules.clone())) as Arc<dyn Ingress>
        });
        Self {
            stats: Arc::new(HandlerStats::new(service.clone())),
            service,
            node: Uuid::new_v4().to_string(),
            pool: Arc::new(ConnectorPool::new()),
            ingress,
            sd: None,
            auther: None,
            bypass: None,
            rate_limiter: None,
            traffic_limiter: None,
            observer: None,
            opts,
        }
    }

    pub fn with_node_id(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    /// Replaces the rules given through `tunnel`.
    pub fn with_ingress(mut self, ingress: Arc<dyn Ingress>) -> Self {
        self.ingress = Some(ingress);
        self
    }

    pub fn with_sd(mut self, sd: Arc<dyn ServiceDiscovery>) -> Self {
        self.sd = Some(sd);
        self
    }

    pub fn with_auther(mut self, auther: Arc<dyn Auther>) -> Self {
        self.auther = Some(auther);
        self
    }

    pub fn with_bypass(mut self, bypass: Arc<dyn Bypass>) -> Self {
        self.bypass = Some(bypass);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_traffic_limiter(mut self, limiter: Arc<dyn TrafficLimiter>) -> Self {
        self.traffic_limiter = Some(limiter);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node
    }

    pub fn pool(&self) -> &Arc<ConnectorPool> {
        &self.pool
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.opts
    }

    pub fn stats(&self) -> &Arc<HandlerStats> {
        &self.stats
    }

    fn dialer(&self) -> TunnelDialer {
        TunnelDialer::new(self.node.clone(), self.pool.clone()).with_sd(self.sd.clone())
    }

    pub(crate) fn pipe(&self) -> Pipe {
        Pipe {
            service: self.service.clone(),
            stats: self.stats.clone(),
            traffic: self.traffic_limiter.clone(),
            opts: self.opts.transport,
        }
    }

    /// Public entrypoint sharing this handler's pool and ingress.
    pub fn entrypoint(&self) -> Entrypoint {
        Entrypoint::new(self.dialer(), self.pipe())
            .with_ingress(self.ingress.clone())
            .with_max_header_bytes(DEFAULT_ENTRYPOINT_MAX_HEADER_BYTES)
    }

    async fn serve(&self, mut conn: Conn, ctx: RequestCtx) -> Result<(), RelayError> {
        if !allow(self.rate_limiter.as_ref(), &conn, &ctx) {
            record_connection_rejected("rate_limit");
            return Err(RelayError::RateLimited);
        }
        let req = read_header(&mut conn, self.opts.read_timeout).await?;

        let treq = match self.parse(req, ctx).await {
            Ok(r) => r,
            Err(e) => {
                let status = match e {
                    RelayError::Unauthorized => Status::Unauthorized,
                    _ => Status::BadRequest,
                };
                reply(&mut conn, status).await;
                return Err(e);
            }
        };
        debug!(
            peer = %conn.peer_display(),
            cmd = treq.req.cmd,
            network = %treq.network,
            src = %treq.src,
            dst = %treq.dst,
            tunnel = %treq.tunnel,
            "tunnel request"
        );

        match treq.req.command() {
            CMD_CONNECT => self.handle_connect(conn, treq).await,
            CMD_BIND => self.handle_bind(conn, treq).await,
            other => {
                reply(&mut conn, Status::BadRequest).await;
                Err(RelayError::UnknownCommand(other))
            }
        }
    }

    async fn parse(&self, req: Request, mut ctx: RequestCtx) -> Result<TunnelRequest, RelayError> {
        if let Some(auther) = &self.auther {
            let (user, pass) = req.user_auth().unwrap_or(("", ""));
            match auther.authenticate(&ctx, user, pass).await {
                Some(id) => ctx = ctx.with_client_id(id),
                None => {
                    debug!(user, "tunnel auth failed");
                    return Err(RelayError::Unauthorized);
                }
            }
        }

        let (tunnel, weight) = match req.tunnel() {
            Some((id, weight)) => (TunnelId::from_bytes(id), weight.unwrap_or(0)),
            None => (TunnelId::default(), 0),
        };
        if tunnel.is_zero() {
            return Err(RelayError::BadRequest("invalid tunnel id".into()));
        }

        let network = if req.is_udp() {
            Network::Udp
        } else {
            req.network().unwrap_or(Network::Tcp)
        };
        let addrs: Vec<String> = req.addrs().iter().map(|a| a.to_string()).collect();
        let src = addrs.first().cloned().unwrap_or_default();
        let dst = addrs.get(1).cloned().unwrap_or_default();

        Ok(TunnelRequest {
            req,
            network,
            src,
            dst,
            tunnel,
            weight,
            ctx,
        })
    }
}

#[async_trait]
impl Handler for TunnelHandler {
    async fn start(&self, shutdown: CancellationToken) -> Result<(), RelayError> {
        self.pool.spawn_sweeper(self.opts.ttl, shutdown.clone());
        if let Some(observer) = &self.observer {
            spawn_observer(
                self.service.clone(),
                observer.clone(),
                self.stats.clone(),
                self.opts.observe_period,
                shutdown.clone(),
            );
        }

        if self.opts.entrypoint.is_empty() {
            return Ok(());
        }
        let ln = TcpListener::bind(&self.opts.entrypoint).await.map_err(|e| {
            RelayError::Config(format!("entrypoint {}: {e}", self.opts.entrypoint))
        })?;
        info!(service = %self.service, addr = %self.opts.entrypoint, node = %self.node, "tunnel entrypoint listening");
        let ep = self.entrypoint();
        let span = info_span!("entrypoint", service = %self.service);
        tokio::spawn(async move { ep.serve(ln, shutdown).await }.instrument(span));
        Ok(())
    }

    async fn handle(&self, conn: Conn, ctx: RequestCtx) -> Result<(), RelayError> {
        let started = Instant::now();
        let peer = conn.peer_display();
        info!(service = %self.service, peer = %peer, local = %conn.local_display(), "connection opened");
        record_request_started(&self.service);

        let res = self.serve(conn, ctx).await;
        if let Err(e) = &res {
            record_handler_error(&self.service, e.error_type());
            warn!(service = %self.service, peer = %peer, error = %e, "tunnel request failed");
        }

        let duration = started.elapsed();
        record_request_finished(&self.service, duration.as_secs_f64());
        info!(service = %self.service, peer = %peer, ?duration, "connection closed");
        res
    }
}

impl std::fmt::Debug for TunnelHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandler")
            .field("service", &self.service)
            .field("node", &self.node)
            .field("pool", &self.pool)
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}
