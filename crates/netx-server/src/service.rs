//! Service accept loops.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use netx_chain::{BindOptions, Listener, Router};
use netx_core::{
    Conn, DEFAULT_ACCEPT_BACKOFF_MS, DEFAULT_CONNECTION_BACKLOG,
    DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS, Network, RequestCtx,
};
use netx_metrics::record_connection_rejected;
use netx_relay::Handler;
use netx_transport::Acceptor;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::error::ServerError;
use crate::util::{ConnectionTracker, create_listener};

/// Where a service gets its connections from.
pub enum ServiceListener {
    /// Local TCP port; `acceptor` wraps each stream (plain or TLS).
    Tcp {
        addr: SocketAddr,
        acceptor: Arc<dyn Acceptor>,
    },
    /// Remote port bound through the router's chain (`rtcp` / `rudp`).
    Reverse {
        router: Arc<Router>,
        network: Network,
        addr: String,
        opts: BindOptions,
    },
}

impl std::fmt::Debug for ServiceListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { addr, .. } => f.debug_struct("Tcp").field("addr", addr).finish(),
            Self::Reverse { network, addr, .. } => f
                .debug_struct("Reverse")
                .field("network", network)
                .field("addr", addr)
                .finish(),
        }
    }
}

/// A configured service, not yet listening.
pub struct Service {
    pub(crate) name: String,
    pub(crate) listener: ServiceListener,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) max_connections: Option<usize>,
    pub(crate) shutdown_timeout: Duration,
}

impl Service {
    pub fn new(name: impl Into<String>, listener: ServiceListener, handler: Arc<dyn Handler>) -> Self {
        Self {
            name: name.into(),
            listener,
            handler,
            max_connections: None,
            shutdown_timeout: Duration::from_secs(netx_core::DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }

    /// `None` is unlimited.
    pub fn with_max_connections(mut self, limit: Option<usize>) -> Self {
        self.max_connections = limit;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn listener(&self) -> &ServiceListener {
        &self.listener
    }

    /// Open the listener. Local ports bind here; reverse listeners bind
    /// through their chain and are re-bound by the accept loop on failure.
    pub async fn bind(self) -> Result<BoundService, ServerError> {
        let source = match self.listener {
            ServiceListener::Tcp { addr, acceptor } => {
                let ln = create_listener(addr, DEFAULT_CONNECTION_BACKLOG)?;
                info!(service = %self.name, addr = %ln.local_addr()?, "listening");
                Source::Tcp { ln, acceptor }
            }
            ServiceListener::Reverse {
                router,
                network,
                addr,
                opts,
            } => {
                let ctx = RequestCtx::new().with_service(&self.name);
                let ln = router.bind(&ctx, network, &addr, &opts).await?;
                info!(service = %self.name, network = %network, addr = %addr, "reverse listener bound");
                Source::Reverse {
                    router,
                    network,
                    addr,
                    opts,
                    ln: Some(ln),
                }
            }
        };
        Ok(BoundService {
            name: self.name,
            source,
            handler: self.handler,
            max_connections: self.max_connections,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

enum Source {
    Tcp {
        ln: TcpListener,
        acceptor: Arc<dyn Acceptor>,
    },
    Reverse {
        router: Arc<Router>,
        network: Network,
        addr: String,
        opts: BindOptions,
        ln: Option<Box<dyn Listener>>,
    },
}

enum Incoming {
    Tcp(TcpStream, SocketAddr),
    Conn(Conn),
}

impl Source {
    async fn accept(&mut self, service: &str) -> io::Result<Incoming> {
        match self {
            Source::Tcp { ln, .. } => {
                let (tcp, peer) = ln.accept().await?;
                Ok(Incoming::Tcp(tcp, peer))
            }
            Source::Reverse {
                router,
                network,
                addr,
                opts,
                ln,
            } => {
                if ln.is_none() {
                    let ctx = RequestCtx::new().with_service(service);
                    let bound = router
                        .bind(&ctx, *network, addr, opts)
                        .await
                        .map_err(io::Error::other)?;
                    info!(service, network = %network, addr = %addr, "reverse listener re-bound");
                    *ln = Some(bound);
                }
                let Some(listener) = ln.as_ref() else {
                    return Err(io::ErrorKind::NotConnected.into());
                };
                match listener.accept().await {
                    Ok(conn) => Ok(Incoming::Conn(conn)),
                    Err(e) => {
                        if let Some(old) = ln.take() {
                            old.close();
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Source::Tcp { ln, .. } => ln.local_addr().ok(),
            Source::Reverse { ln, .. } => ln.as_ref().and_then(|l| l.local_addr()),
        }
    }

    fn close(&mut self) {
        if let Source::Reverse { ln, .. } = self
            && let Some(ln) = ln.take()
        {
            ln.close();
        }
    }
}

/// A listening service.
pub struct BoundService {
    name: String,
    source: Source,
    handler: Arc<dyn Handler>,
    max_connections: Option<usize>,
    shutdown_timeout: Duration,
}

impl BoundService {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local port for TCP services; the address reported by the peer for
    /// reverse listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.source.local_addr()
    }

    /// Accept until `shutdown` fires, then wait for in-flight connections.
    pub async fn serve(mut self, shutdown: CancellationToken) -> Result<(), ServerError> {
        self.handler.start(shutdown.clone()).await?;

        let tracker = ConnectionTracker::new();
        let conn_limit = self.max_connections.map(|n| {
            info!(service = %self.name, max_connections = n, "connection limit set");
            Arc::new(Semaphore::new(n))
        });
        let backoff = Duration::from_millis(DEFAULT_ACCEPT_BACKOFF_MS);

        loop {
            let incoming = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(service = %self.name, "stopping accept loop");
                    break;
                }

                res = self.source.accept(&self.name) => res,
            };

            let incoming = match incoming {
                Ok(i) => i,
                Err(e) => {
                    warn!(service = %self.name, error = %e, "accept failed, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => continue,
                    }
                }
            };

            let permit: Option<OwnedSemaphorePermit> = match &conn_limit {
                Some(sem) => match sem.clone().try_acquire_owned() {
                    Ok(p) => Some(p),
                    Err(_) => {
                        debug!(service = %self.name, reason = "max_connections", "connection rejected");
                        record_connection_rejected("max_connections");
                        continue;
                    }
                },
                None => None,
            };

            let guard = tracker.guard();
            let handler = self.handler.clone();
            let service = self.name.clone();
            let acceptor = match &self.source {
                Source::Tcp { acceptor, .. } => Some(acceptor.clone()),
                Source::Reverse { .. } => None,
            };
            let peer = match &incoming {
                Incoming::Tcp(_, peer) => peer.to_string(),
                Incoming::Conn(c) => c.peer_display(),
            };
            let span = info_span!("conn", service = %service, peer = %peer);

            tokio::spawn(
                async move {
                    let _guard = guard;
                    let _permit = permit;
                    let conn = match (incoming, acceptor) {
                        (Incoming::Tcp(tcp, _), Some(acceptor)) => {
                            let timeout = Duration::from_secs(DEFAULT_TLS_HANDSHAKE_TIMEOUT_SECS);
                            match tokio::time::timeout(timeout, acceptor.accept(tcp)).await {
                                Ok(Ok(conn)) => conn,
                                Ok(Err(e)) => {
                                    warn!(error = %e, "accept handshake failed");
                                    return;
                                }
                                Err(_) => {
                                    warn!(timeout_secs = timeout.as_secs(), "accept handshake timed out");
                                    return;
                                }
                            }
                        }
                        (Incoming::Tcp(tcp, _), None) => Conn::from_tcp(tcp),
                        (Incoming::Conn(conn), _) => conn,
                    };
                    let ctx = RequestCtx::new()
                        .with_service(&service)
                        .with_client_addr(&peer);
                    if let Err(e) = handler.handle(conn, ctx).await {
                        debug!(error = %e, error_type = e.error_type(), "request ended with error");
                    }
                }
                .instrument(span),
            );
        }

        self.source.close();

        let active = tracker.count();
        if active > 0 {
            info!(service = %self.name, active, "waiting for connections to drain");
            if tracker.wait_for_zero(self.shutdown_timeout).await {
                info!(service = %self.name, "all connections drained");
            } else {
                warn!(service = %self.name, active = tracker.count(), "shutdown timeout, connections still active");
            }
        }
        info!(service = %self.name, "service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use netx_relay::RelayError;
    use netx_transport::PlainAcceptor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    /// Echoes everything back.
    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, mut conn: Conn, _ctx: RequestCtx) -> Result<(), RelayError> {
            let mut buf = [0u8; 64];
            loop {
                let n = conn.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                conn.write_all(&buf[..n]).await?;
            }
        }
    }

    fn echo_service(limit: Option<usize>) -> Service {
        Service::new(
            "echo",
            ServiceListener::Tcp {
                addr: "127.0.0.1:0".parse().unwrap(),
                acceptor: Arc::new(PlainAcceptor),
            },
            Arc::new(Echo),
        )
        .with_max_connections(limit)
        .with_shutdown_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let bound = echo_service(None).bind().await.unwrap();
        let addr = bound.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(bound.serve(shutdown.clone()));

        let mut c = TcpStream::connect(addr).await.unwrap();
        c.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(c);

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn connection_limit_drops_extra_clients() {
        let bound = echo_service(Some(1)).bind().await.unwrap();
        let addr = bound.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(bound.serve(shutdown.clone()));

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"a").await.unwrap();
        let mut one = [0u8; 1];
        first.read_exact(&mut one).await.unwrap();

        let mut second = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        drop(first);
        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
