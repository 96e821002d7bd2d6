//! Relay protocol server: CONNECT, BIND and static forwarding, plus the
//! header-less port forwarder.

mod bind;
mod connect;
mod forward;
mod port;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netx_chain::{Hop, Router};
use netx_core::auth::Auther;
use netx_core::bypass::Bypass;
use netx_core::io::TransportOptions;
use netx_core::limiter::{RateLimiter, TrafficLimiter};
use netx_core::net::host_of;
use netx_core::observer::{HandlerStats, Observer};
use netx_core::{
    Conn, DEFAULT_OBSERVE_PERIOD_SECS, DEFAULT_RELAY_BUFFER_SIZE, DEFAULT_UDP_BUFFER_SIZE,
    MAX_UDP_BUFFER_SIZE, MIN_UDP_BUFFER_SIZE, Metadata, Network, RequestCtx,
};
use netx_metrics::{
    record_connection_rejected, record_handler_error, record_request_finished,
    record_request_started,
};
use netx_proto::{
    CMD_BIND, CMD_CONNECT, Features, ParseError, ProtoError, Request, Response, Status,
    read_request, write_response,
};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::mux::MuxConfig;

pub use port::{ForwardHandler, ForwardOptions};

/// Serves one inbound connection to completion.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Spawn background work that lives until `shutdown` fires.
    async fn start(&self, _shutdown: CancellationToken) -> Result<(), RelayError> {
        Ok(())
    }

    async fn handle(&self, conn: Conn, ctx: RequestCtx) -> Result<(), RelayError>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn start(&self, shutdown: CancellationToken) -> Result<(), RelayError> {
        (**self).start(shutdown).await
    }

    async fn handle(&self, conn: Conn, ctx: RequestCtx) -> Result<(), RelayError> {
        (**self).handle(conn, ctx).await
    }
}

/// Knobs read from the handler metadata.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub read_timeout: Option<Duration>,
    pub enable_bind: bool,
    /// Write the response immediately instead of with the first payload.
    pub nodelay: bool,
    pub udp_buffer_size: usize,
    /// `"host"` makes the target address the hash selector source.
    pub hash: String,
    pub mux: MuxConfig,
    pub observe_period: Duration,
    pub transport: TransportOptions,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            read_timeout: None,
            enable_bind: false,
            nodelay: false,
            udp_buffer_size: DEFAULT_UDP_BUFFER_SIZE,
            hash: String::new(),
            mux: MuxConfig::default(),
            observe_period: Duration::from_secs(DEFAULT_OBSERVE_PERIOD_SECS),
            transport: TransportOptions::default(),
        }
    }
}

impl RelayOptions {
    pub fn from_metadata(md: &Metadata) -> Self {
        let read_timeout = md.get_duration("readTimeout");
        let udp_buffer_size = match md.get_int("udpBufferSize") {
            n if n > 0 => (n as usize).clamp(MIN_UDP_BUFFER_SIZE, MAX_UDP_BUFFER_SIZE),
            _ => DEFAULT_UDP_BUFFER_SIZE,
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

        Self {
            read_timeout: (!read_timeout.is_zero()).then_some(read_timeout),
            enable_bind: md.get_bool("bind"),
            nodelay: md.get_bool("nodelay"),
            udp_buffer_size,
            hash: md.get_string("hash"),
            mux: MuxConfig::from_metadata(md),
            observe_period,
            transport: TransportOptions {
                buffer_size,
                idle_timeout: (!idle.is_zero()).then_some(idle),
            },
        }
    }
}

/// Request fields the dispatch needs.
pub(crate) struct Parsed {
    pub network: Network,
    pub address: String,
    pub ctx: RequestCtx,
}

pub struct RelayHandler {
    service: String,
    router: Arc<Router>,
    hop: Option<Arc<Hop>>,
    auther: Option<Arc<dyn Auther>>,
    bypass: Option<Arc<dyn Bypass>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    traffic_limiter: Option<Arc<dyn TrafficLimiter>>,
    observer: Option<Arc<dyn Observer>>,
    stats: Arc<HandlerStats>,
    opts: RelayOptions,
}

impl RelayHandler {
    pub fn new(service: impl Into<String>, router: Arc<Router>, opts: RelayOptions) -> Self {
        let service = service.into();
        Self {
            stats: Arc::new(HandlerStats::new(service.clone())),
            service,
            router,
            hop: None,
            auther: None,
            bypass: None,
            rate_limiter: None,
            traffic_limiter: None,
            observer: None,
            opts,
        }
    }

    /// Static forwarding: every request goes to a node of `hop`.
    pub fn with_hop(mut self, hop: Arc<Hop>) -> Self {
        self.hop = Some(hop);
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

    pub fn options(&self) -> &RelayOptions {
        &self.opts
    }

    pub fn stats(&self) -> &Arc<HandlerStats> {
        &self.stats
    }

    /// Push client stats to the observer every `observePeriod` until
    /// `shutdown` fires. `None` without an observer.
    pub fn spawn_observer(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let observer = self.observer.clone()?;
        Some(spawn_observer(
            self.service.clone(),
            observer,
            self.stats.clone(),
            self.opts.observe_period,
            shutdown,
        ))
    }

    async fn serve(&self, mut conn: Conn, ctx: RequestCtx) -> Result<(), RelayError> {
        if !allow(self.rate_limiter.as_ref(), &conn, &ctx) {
            record_connection_rejected("rate_limit");
            return Err(RelayError::RateLimited);
        }
        let req = read_header(&mut conn, self.opts.read_timeout).await?;

        let parsed = match self.authorize(&mut conn, &req, ctx).await {
            Ok(parsed) => parsed,
            Err(e) => {
                reply(&mut conn, Status::Unauthorized).await;
                return Err(e);
            }
        };
        debug!(
            peer = %conn.peer_display(),
            cmd = req.cmd,
            network = %parsed.network,
            dst = %parsed.address,
            "relay request"
        );

        if let Some(hop) = &self.hop {
            return self.handle_forward(conn, hop, parsed).await;
        }
        match req.command() {
            CMD_CONNECT => self.handle_connect(conn, parsed).await,
            CMD_BIND => self.handle_bind(conn, parsed).await,
            other => {
                reply(&mut conn, Status::BadRequest).await;
                Err(RelayError::UnknownCommand(other))
            }
        }
    }

    async fn authorize(
        &self,
        conn: &mut Conn,
        req: &Request,
        mut ctx: RequestCtx,
    ) -> Result<Parsed, RelayError> {
        let (user, pass) = req.user_auth().unwrap_or(("", ""));
        if let Some(auther) = &self.auther {
            match auther.authenticate(&ctx, user, pass).await {
                Some(id) => ctx = ctx.with_client_id(id),
                None => {
                    debug!(peer = %conn.peer_display(), user, "relay auth failed");
                    return Err(RelayError::Unauthorized);
                }
            }
        }

        let network = if req.is_udp() {
            Network::Udp
        } else {
            req.network().unwrap_or(Network::Tcp)
        };
        let address = req
            .addrs()
            .last()
            .map(|a| a.to_string())
            .unwrap_or_default();
        Ok(Parsed {
            network,
            address,
            ctx,
        })
    }
}

#[async_trait]
impl Handler for RelayHandler {
    async fn start(&self, shutdown: CancellationToken) -> Result<(), RelayError> {
        self.spawn_observer(shutdown);
        Ok(())
    }

    async fn handle(&self, conn: Conn, ctx: RequestCtx) -> Result<(), RelayError> {
        let started = Instant::now();
        let peer = conn.peer_display();
        let local = conn.local_display();
        info!(service = %self.service, peer = %peer, local = %local, "connection opened");
        record_request_started(&self.service);

        let res = self.serve(conn, ctx).await;
        if let Err(e) = &res {
            record_handler_error(&self.service, e.error_type());
        }

        let duration = started.elapsed();
        record_request_finished(&self.service, duration.as_secs_f64());
        info!(service = %self.service, peer = %peer, ?duration, "connection closed");
        res
    }
}

impl std::fmt::Debug for RelayHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandler")
            .field("service", &self.service)
            .field("forward", &self.hop.as_ref().map(|h| h.name().to_string()))
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

/// Per-source rate limit, keyed by the client host.
pub(crate) fn allow(limiter: Option<&Arc<dyn RateLimiter>>, conn: &Conn, ctx: &RequestCtx) -> bool {
    let Some(limiter) = limiter else {
        return true;
    };
    let peer = ctx
        .client_addr
        .clone()
        .unwrap_or_else(|| conn.peer_display());
    limiter
        .limiter(host_of(&peer))
        .is_none_or(|l| l.allow(1))
}

/// Key for traffic limits and stats.
pub(crate) fn client_key(conn: &Conn, ctx: &RequestCtx) -> String {
    match &ctx.client_id {
        Some(id) if !id.is_empty() => id.clone(),
        _ => host_of(&conn.peer_display()).to_string(),
    }
}

/// Read the request header, bounded by `timeout`. A version mismatch is
/// answered with `BadRequest`.
pub(crate) async fn read_header(
    conn: &mut Conn,
    timeout: Option<Duration>,
) -> Result<Request, RelayError> {
    let read = read_request(conn);
    let req = match timeout {
        Some(t) => tokio::time::timeout(t, read)
            .await
            .map_err(|_| RelayError::Timeout(t))?,
        None => read.await,
    };
    match req {
        Ok(req) => Ok(req),
        Err(ProtoError::Parse(ParseError::InvalidVersion(v))) => {
            reply(conn, Status::BadRequest).await;
            Err(RelayError::BadVersion(v))
        }
        Err(e) => Err(e.into()),
    }
}

/// Best-effort status reply; the caller is about to drop the connection.
pub(crate) async fn reply(conn: &mut Conn, status: Status) {
    if let Err(e) = write_response(conn, &Response::new(status)).await {
        debug!(status = %status, error = %e, "failed to write relay response");
    }
}

pub(crate) fn spawn_observer(
    service: String,
    observer: Arc<dyn Observer>,
    stats: Arc<HandlerStats>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let events = stats.take_events();
                    if events.is_empty() {
                        continue;
                    }
                    if let Err(e) = observer.observe(events).await {
                        warn!(service = %service, error = %e, "observe stats failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests;
