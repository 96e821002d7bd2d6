//! Connection-oriented view over a datagram socket.
//!
//! [`UdpListener`] demultiplexes packets by source address into per-peer
//! [`UdpConn`] streams. Peers that stay silent for two sweep periods are
//! evicted and their streams reach EOF.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::PacketConn;
use crate::defaults::{
    DEFAULT_UDP_BACKLOG, DEFAULT_UDP_BUFFER_SIZE, DEFAULT_UDP_CONN_TTL_SECS,
    DEFAULT_UDP_QUEUE_SIZE,
};

#[derive(Debug, Clone)]
pub struct UdpListenerConfig {
    /// Pending, not yet accepted peer connections.
    pub backlog: usize,
    /// Queued inbound datagrams per peer before new ones are dropped.
    pub queue_size: usize,
    pub read_buffer_size: usize,
    /// Sweep period; a peer idle for two periods is evicted.
    pub ttl: Duration,
    /// Keep peers alive after their first response instead of closing.
    pub keepalive: bool,
}

impl Default for UdpListenerConfig {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_UDP_BACKLOG,
            queue_size: DEFAULT_UDP_QUEUE_SIZE,
            read_buffer_size: DEFAULT_UDP_BUFFER_SIZE,
            ttl: Duration::from_secs(DEFAULT_UDP_CONN_TTL_SECS),
            keepalive: true,
        }
    }
}

struct PeerEntry {
    tx: mpsc::Sender<Bytes>,
    idle: Arc<AtomicBool>,
    closed: CancellationToken,
}

type PeerPool = Arc<Mutex<HashMap<SocketAddr, PeerEntry>>>;

pub struct UdpListener {
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<UdpConn>>,
    local_addr: Option<SocketAddr>,
    pool: PeerPool,
    shutdown: CancellationToken,
}

impl UdpListener {
    /// Start demultiplexing `pc`. Must be called inside a tokio runtime.
    pub fn new(pc: Arc<dyn PacketConn>, config: UdpListenerConfig) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(config.backlog.max(1));
        let pool: PeerPool = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let local_addr = pc.local_addr();

        tokio::spawn(listen_loop(
            pc,
            config.clone(),
            pool.clone(),
            accept_tx,
            shutdown.clone(),
        ));
        tokio::spawn(sweep_loop(pool.clone(), config.ttl, shutdown.clone()));

        Self {
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            local_addr,
            pool,
            shutdown,
        }
    }

    pub async fn accept(&self) -> io::Result<UdpConn> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            conn = rx.recv() => conn.ok_or_else(closed_error),
            _ = self.shutdown.cancelled() => Err(closed_error()),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of live peers.
    pub fn peers(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn close(&self) {
        self.shutdown.cancel();
        for (_, entry) in self.pool.lock().drain() {
            entry.closed.cancel();
        }
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "udp listener closed")
}

async fn listen_loop(
    pc: Arc<dyn PacketConn>,
    config: UdpListenerConfig,
    pool: PeerPool,
    accept_tx: mpsc::Sender<UdpConn>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];
    loop {
        let (n, raddr) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            res = pc.recv_from(&mut buf) => match res {
                Ok(v) => v,
                Err(e) => {
                    debug!(error = %e, "udp listener read failed");
                    shutdown.cancel();
                    return;
                }
            },
        };
        let packet = Bytes::copy_from_slice(&buf[..n]);

        let mut peers = pool.lock();
        if let Some(entry) = peers.get(&raddr)
            && entry.closed.is_cancelled()
        {
            peers.remove(&raddr);
        }
        if let Some(entry) = peers.get(&raddr) {
            entry.idle.store(false, Ordering::Relaxed);
            if entry.tx.try_send(packet).is_err() {
                trace!(peer = %raddr, "udp peer queue full, packet dropped");
            }
            continue;
        }

        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let idle = Arc::new(AtomicBool::new(false));
        let closed = CancellationToken::new();
        let conn = UdpConn {
            pc: pc.clone(),
            local_addr: pc.local_addr(),
            peer_addr: raddr,
            rx,
            idle: idle.clone(),
            closed: closed.clone(),
            keepalive: config.keepalive,
            pending_write: None,
        };
        if accept_tx.try_send(conn).is_err() {
            debug!(peer = %raddr, "udp accept backlog full, peer dropped");
            continue;
        }
        let _ = tx.try_send(packet);
        peers.insert(raddr, PeerEntry { tx, idle, closed });
        trace!(peer = %raddr, "new udp peer");
    }
}

async fn sweep_loop(pool: PeerPool, ttl: Duration, shutdown: CancellationToken) {
    let period = if ttl.is_zero() {
        Duration::from_secs(DEFAULT_UDP_CONN_TTL_SECS)
    } else {
        ttl
    };
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        pool.lock().retain(|addr, entry| {
            if entry.closed.is_cancelled() {
                return false;
            }
            if entry.idle.swap(true, Ordering::Relaxed) {
                trace!(peer = %addr, "udp peer idle, evicted");
                entry.closed.cancel();
                return false;
            }
            true
        });
    }
}

type SendFuture = Pin<Box<dyn Future<Output = io::Result<usize>> + Send>>;

/// One peer of a [`UdpListener`]. Reads yield whole datagrams (truncated to
/// the read buffer); writes send one datagram back to the peer.
pub struct UdpConn {
    pc: Arc<dyn PacketConn>,
    local_addr: Option<SocketAddr>,
    peer_addr: SocketAddr,
    rx: mpsc::Receiver<Bytes>,
    idle: Arc<AtomicBool>,
    closed: CancellationToken,
    keepalive: bool,
    pending_write: Option<SendFuture>,
}

impl UdpConn {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for UdpConn {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl AsyncRead for UdpConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.closed.is_cancelled() {
            return Poll::Ready(Ok(()));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(packet)) => {
                self.idle.store(false, Ordering::Relaxed);
                let n = packet.len().min(buf.remaining());
                buf.put_slice(&packet[..n]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for UdpConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.closed.is_cancelled() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "udp conn closed",
            )));
        }
        if self.pending_write.is_none() {
            let pc = self.pc.clone();
            let target = self.peer_addr;
            let data = buf.to_vec();
            self.pending_write = Some(Box::pin(async move { pc.send_to(&data, target).await }));
        }
        let Some(fut) = self.pending_write.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        match fut.as_mut().poll(cx) {
            Poll::Ready(res) => {
                self.pending_write = None;
                self.idle.store(false, Ordering::Relaxed);
                if !self.keepalive {
                    self.closed.cancel();
                }
                Poll::Ready(res)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.closed.cancel();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UdpSocket;

    async fn listener(ttl: Duration) -> (UdpListener, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let cfg = UdpListenerConfig {
            ttl,
            ..Default::default()
        };
        (UdpListener::new(Arc::new(socket), cfg), addr)
    }

    #[tokio::test]
    async fn demultiplexes_peers() {
        let (ln, addr) = listener(Duration::from_secs(5)).await;
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        a.send_to(b"from-a", addr).await.unwrap();
        let mut ca = ln.accept().await.unwrap();
        b.send_to(b"from-b", addr).await.unwrap();
        let mut cb = ln.accept().await.unwrap();

        assert_eq!(ca.peer_addr(), a.local_addr().unwrap());
        assert_eq!(cb.peer_addr(), b.local_addr().unwrap());

        let mut buf = [0u8; 64];
        let n = ca.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from-a");
        let n = cb.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"from-b");

        a.send_to(b"again", addr).await.unwrap();
        let n = ca.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"again");
        assert_eq!(ln.peers(), 2);

        ca.write_all(b"reply").await.unwrap();
        let (n, from) = a.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");
        assert_eq!(from, addr);
    }

    #[tokio::test]
    async fn idle_peers_are_evicted() {
        let (ln, addr) = listener(Duration::from_millis(50)).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"x", addr).await.unwrap();
        let mut conn = ln.accept().await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ln.peers(), 0);
        assert!(conn.is_closed());
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }
}
