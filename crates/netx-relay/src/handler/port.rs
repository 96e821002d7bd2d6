//! Plain port forwarding: no request header, the hop picks the target.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netx_chain::{ChainError, Hop, HopSelection, Router};
use netx_core::bypass::Bypass;
use netx_core::io::TransportOptions;
use netx_core::limiter::{RateLimiter, TrafficLimiter};
use netx_core::observer::{HandlerStats, Observer};
use netx_core::{
    Conn, DEFAULT_OBSERVE_PERIOD_SECS, DEFAULT_RELAY_BUFFER_SIZE, Metadata, Network, RequestCtx,
};
use netx_metrics::{
    record_connection_rejected, record_handler_error, record_request_finished,
    record_request_started,
};
use netx_selector::Selectable;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Handler, allow, client_key, spawn_observer};
use crate::error::RelayError;
use crate::pipe::Pipe;

#[derive(Debug, Clone)]
pub struct ForwardOptions {
    pub observe_period: Duration,
    pub transport: TransportOptions,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            observe_period: Duration::from_secs(DEFAULT_OBSERVE_PERIOD_SECS),
            transport: TransportOptions::default(),
        }
    }
}

impl ForwardOptions {
    pub fn from_metadata(md: &Metadata) -> Self {
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
            observe_period,
            transport: TransportOptions {
                buffer_size,
                idle_timeout: (!idle.is_zero()).then_some(idle),
            },
        }
    }
}

/// Forwards every inbound connection of `network` to a node of the hop,
/// dialed through the router.
pub struct ForwardHandler {
    service: String,
    network: Network,
    router: Arc<Router>,
    hop: Arc<Hop>,
    bypass: Option<Arc<dyn Bypass>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    traffic_limiter: Option<Arc<dyn TrafficLimiter>>,
    observer: Option<Arc<dyn Observer>>,
    stats: Arc<HandlerStats>,
    opts: ForwardOptions,
}

impl ForwardHandler {
    pub fn new(
        service: impl Into<String>,
        network: Network,
        router: Arc<Router>,
        hop: Arc<Hop>,
        opts: ForwardOptions,
    ) -> Self {
        let service = service.into();
        Self {
            stats: Arc::new(HandlerStats::new(service.clone())),
            service,
            network,
            router,
            hop,
            bypass: None,
            rate_limiter: None,
            traffic_limiter: None,
            observer: None,
            opts,
        }
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

    pub fn hop(&self) -> &Arc<Hop> {
        &self.hop
    }

    pub fn stats(&self) -> &Arc<HandlerStats> {
        &self.stats
    }

    async fn serve(&self, conn: Conn, ctx: RequestCtx) -> Result<(), RelayError> {
        if !allow(self.rate_limiter.as_ref(), &conn, &ctx) {
            record_connection_rejected("rate_limit");
            return Err(RelayError::RateLimited);
        }

        let target = match self.hop.select(&ctx, self.network, "") {
            HopSelection::Node(node) => node,
            HopSelection::Bypass | HopSelection::Unavailable => {
                debug!(hop = %self.hop.name(), "no target available");
                return Err(ChainError::NodeUnavailable.into());
            }
        };
        if self
            .bypass
            .as_ref()
            .is_some_and(|b| b.contains(self.network, &target.addr))
        {
            debug!(dst = %target.addr, "forward target bypassed");
            return Err(RelayError::Forbidden(target.addr.clone()));
        }
        debug!(node = %target.name, dst = %target.addr, network = %self.network, "forward");

        let upstream = match self.router.dial(&ctx, self.network, &target.addr).await {
            Ok(c) => {
                if let Some(m) = target.marker() {
                    m.reset();
                }
                c
            }
            Err(e) => {
                if let Some(m) = target.marker() {
                    m.mark();
                }
                warn!(node = %target.name, dst = %target.addr, error = %e, "forward dial failed");
                return Err(e.into());
            }
        };

        let client = client_key(&conn, &ctx);
        self.pipe().run(conn, upstream, &client).await
    }

    fn pipe(&self) -> Pipe {
        Pipe {
            service: self.service.clone(),
            stats: self.stats.clone(),
            traffic: self.traffic_limiter.clone(),
            opts: self.opts.transport,
        }
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    async fn start(&self, shutdown: CancellationToken) -> Result<(), RelayError> {
        if let Some(observer) = &self.observer {
            spawn_observer(
                self.service.clone(),
                observer.clone(),
                self.stats.clone(),
                self.opts.observe_period,
                shutdown,
            );
        }
        Ok(())
    }

    async fn handle(&self, conn: Conn, ctx: RequestCtx) -> Result<(), RelayError> {
        let started = Instant::now();
        let peer = conn.peer_display();
        info!(service = %self.service, peer = %peer, "connection opened");
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

impl std::fmt::Debug for ForwardHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardHandler")
            .field("service", &self.service)
            .field("network", &self.network)
            .field("hop", &self.hop.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use netx_chain::Node;
    use netx_core::bypass::AddrBypass;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::testing::{echo_server, unused_transport};

    fn forwarder(nodes: Vec<Arc<Node>>) -> ForwardHandler {
        ForwardHandler::new(
            "fwd-test",
            Network::Tcp,
            Arc::new(Router::new()),
            Arc::new(Hop::new("targets", nodes)),
            ForwardOptions::default(),
        )
    }

    #[tokio::test]
    async fn forwards_raw_bytes_to_hop_node() {
        let echo = echo_server().await;
        let node = Arc::new(Node::new("echo", echo.to_string(), unused_transport()));
        let h = Arc::new(forwarder(vec![node]));

        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn({
            let h = h.clone();
            async move { h.handle(Conn::new(server), RequestCtx::new()).await }
        });
        let mut client = Conn::new(client);
        client.write_all(b"plain").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"plain");
        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn empty_hop_is_unavailable() {
        let (_client, server) = tokio::io::duplex(64);
        let err = forwarder(Vec::new())
            .handle(Conn::new(server), RequestCtx::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Chain(ChainError::NodeUnavailable)));
    }

    #[tokio::test]
    async fn failed_dial_marks_node() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = ln.local_addr().unwrap();
        drop(ln);
        let node = Arc::new(Node::new("dead", dead.to_string(), unused_transport()));
        let h = forwarder(vec![node.clone()]);

        let (_client, server) = tokio::io::duplex(64);
        assert!(h.handle(Conn::new(server), RequestCtx::new()).await.is_err());
        assert!(node.marker().is_some_and(|m| m.count() > 0));
    }

    #[tokio::test]
    async fn bypassed_target_is_forbidden() {
        let echo = echo_server().await;
        let node = Arc::new(Node::new("echo", echo.to_string(), unused_transport()));
        let h = forwarder(vec![node])
            .with_bypass(Arc::new(AddrBypass::new(["127.0.0.1"])));
        let (_client, server) = tokio::io::duplex(64);
        let err = h.handle(Conn::new(server), RequestCtx::new()).await.unwrap_err();
        assert!(matches!(err, RelayError::Forbidden(_)));
    }
}
