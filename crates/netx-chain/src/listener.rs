//! [`Listener`] adapters over local sockets.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use netx_core::Conn;
use netx_core::net::udp::UdpListener;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::transport::Listener;

pub struct TcpListenerAdapter {
    inner: TcpListener,
    nodelay: bool,
    closed: CancellationToken,
}

impl TcpListenerAdapter {
    pub fn new(inner: TcpListener, nodelay: bool) -> Self {
        Self {
            inner,
            nodelay,
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Listener for TcpListenerAdapter {
    async fn accept(&self) -> io::Result<Conn> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
            res = self.inner.accept() => {
                let (stream, _) = res?;
                if self.nodelay {
                    let _ = stream.set_nodelay(true);
                }
                Ok(Conn::from_tcp(stream))
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr().ok()
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Each distinct source address becomes one accepted connection.
pub struct UdpListenerAdapter {
    inner: UdpListener,
}

impl UdpListenerAdapter {
    pub fn new(inner: UdpListener) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Listener for UdpListenerAdapter {
    async fn accept(&self) -> io::Result<Conn> {
        let conn = self.inner.accept().await?;
        let local = conn.local_addr();
        let peer = conn.peer_addr();
        Ok(Conn::new(conn)
            .with_local_addr(local)
            .with_peer_addr(Some(peer)))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn close(&self) {
        self.inner.close();
    }
}
