//! Stream multiplexing over one connection.
//!
//! Handlers and connectors only see the [`Session`] contract. [`MuxSession`]
//! implements it on top of yamux: a driver task owns the yamux connection,
//! serves stream-open requests from a channel and queues inbound streams
//! for [`Session::accept`].

use std::future::{Future, poll_fn};
use std::io;
use std::net::SocketAddr;
use std::task::Poll;

use async_trait::async_trait;
use netx_core::{Conn, Metadata};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const DEFAULT_MAX_STREAMS: usize = 512;
const MAX_STREAMS_LIMIT: usize = 4096;
const DEFAULT_ACCEPT_BACKLOG: usize = 128;

#[async_trait]
pub trait Session: Send + Sync {
    /// Open a new outbound stream.
    async fn open(&self) -> io::Result<Conn>;

    /// Next stream opened by the peer.
    async fn accept(&self) -> io::Result<Conn>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Resolves once the session has ended.
    async fn closed(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    pub max_streams: usize,
    /// Largest data frame; `None` keeps the yamux default.
    pub max_frame_size: Option<usize>,
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            max_frame_size: None,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
        }
    }
}

impl MuxConfig {
    /// Reads `mux.maxStreams`, `mux.maxFrameSize` and `mux.backlog`.
    pub fn from_metadata(md: &Metadata) -> Self {
        let mut cfg = Self::default();
        let n = md.get_int("mux.maxStreams");
        if n > 0 {
            cfg.max_streams = (n as usize).min(MAX_STREAMS_LIMIT);
        }
        let n = md.get_int("mux.maxFrameSize");
        if n > 0 {
            cfg.max_frame_size = Some(n as usize);
        }
        let n = md.get_int("mux.backlog");
        if n > 0 {
            cfg.accept_backlog = n as usize;
        }
        cfg
    }

    fn yamux(&self) -> yamux::Config {
        let mut cfg = yamux::Config::default();
        cfg.set_max_num_streams(self.max_streams.clamp(1, MAX_STREAMS_LIMIT));
        if let Some(n) = self.max_frame_size {
            cfg.set_split_send_size(n);
        }
        cfg
    }
}

type OpenReply = oneshot::Sender<io::Result<yamux::Stream>>;

/// A yamux session. Dropping the last handle closes it.
pub struct MuxSession {
    open_tx: mpsc::Sender<OpenReply>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<yamux::Stream>>,
    shutdown: CancellationToken,
    done: CancellationToken,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl MuxSession {
    /// Client side: stream ids are odd. The relay handler takes this role.
    pub fn client(conn: Conn, cfg: &MuxConfig) -> Self {
        Self::spawn(conn, cfg, yamux::Mode::Client)
    }

    /// Server side: stream ids are even. Relay connectors take this role.
    pub fn server(conn: Conn, cfg: &MuxConfig) -> Self {
        Self::spawn(conn, cfg, yamux::Mode::Server)
    }

    fn spawn(conn: Conn, cfg: &MuxConfig, mode: yamux::Mode) -> Self {
        let local_addr = conn.local_addr();
        let peer_addr = conn.peer_addr();
        let (open_tx, open_rx) = mpsc::channel(16);
        let (inbound_tx, inbound_rx) = mpsc::channel(cfg.accept_backlog.max(1));
        let shutdown = CancellationToken::new();
        let done = CancellationToken::new();

        let connection = yamux::Connection::new(conn.compat(), cfg.yamux(), mode);
        tokio::spawn(drive(
            connection,
            open_rx,
            inbound_tx,
            shutdown.clone(),
            done.clone(),
        ));

        Self {
            open_tx,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            shutdown,
            done,
            local_addr,
            peer_addr,
        }
    }

    fn wrap(&self, stream: yamux::Stream) -> Conn {
        Conn::new(stream.compat())
            .with_local_addr(self.local_addr)
            .with_peer_addr(self.peer_addr)
    }
}

fn session_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "mux session closed")
}

#[async_trait]
impl Session for MuxSession {
    async fn open(&self) -> io::Result<Conn> {
        let (tx, rx) = oneshot::channel();
        self.open_tx.send(tx).await.map_err(|_| session_closed())?;
        let stream = rx.await.map_err(|_| session_closed())??;
        Ok(self.wrap(stream))
    }

    async fn accept(&self) -> io::Result<Conn> {
        let mut rx = self.inbound.lock().await;
        match rx.recv().await {
            Some(stream) => Ok(self.wrap(stream)),
            None => Err(session_closed()),
        }
    }

    fn close(&self) {
        self.shutdown.cancel();
    }

    fn is_closed(&self) -> bool {
        self.done.is_cancelled() || self.shutdown.is_cancelled()
    }

    async fn closed(&self) {
        self.done.cancelled().await
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxSession")
            .field("peer", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn drive(
    mut connection: yamux::Connection<Compat<Conn>>,
    mut open_rx: mpsc::Receiver<OpenReply>,
    inbound_tx: mpsc::Sender<yamux::Stream>,
    shutdown: CancellationToken,
    done: CancellationToken,
) {
    let cancelled = shutdown.cancelled();
    tokio::pin!(cancelled);
    let mut pending: Option<OpenReply> = None;

    let result = poll_fn(|cx| {
        loop {
            if cancelled.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Ok(()));
            }
            let mut progressed = false;

            if pending.is_none() {
                match open_rx.poll_recv(cx) {
                    Poll::Ready(Some(reply)) => pending = Some(reply),
                    // every handle is gone
                    Poll::Ready(None) => return Poll::Ready(Ok(())),
                    Poll::Pending => {}
                }
            }
            if let Some(reply) = pending.take() {
                match connection.poll_new_outbound(cx) {
                    Poll::Ready(Ok(stream)) => {
                        let _ = reply.send(Ok(stream));
                        progressed = true;
                    }
                    Poll::Ready(Err(e)) => {
                        let _ = reply.send(Err(io::Error::other(e.to_string())));
                        return Poll::Ready(Err(e));
                    }
                    Poll::Pending => pending = Some(reply),
                }
            }

            match connection.poll_next_inbound(cx) {
                Poll::Ready(Some(Ok(stream))) => {
                    if inbound_tx.try_send(stream).is_err() {
                        trace!("mux accept queue full or unused, dropping stream");
                    }
                    progressed = true;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Err(e)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => {}
            }

            if !progressed {
                return Poll::Pending;
            }
        }
    })
    .await;

    if let Err(e) = result {
        debug!(error = %e, "mux session ended");
    }
    let _ = poll_fn(|cx| connection.poll_close(cx)).await;
    done.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (MuxSession, MuxSession) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cfg = MuxConfig::default();
        (
            MuxSession::client(Conn::new(a), &cfg),
            MuxSession::server(Conn::new(b), &cfg),
        )
    }

    #[tokio::test]
    async fn streams_flow_both_ways() {
        let (client, server) = pair();

        let mut out = client.open().await.unwrap();
        out.write_all(b"ping").await.unwrap();
        out.flush().await.unwrap();

        let mut inbound = server.accept().await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        inbound.write_all(b"pong").await.unwrap();
        inbound.flush().await.unwrap();
        out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn close_ends_peer_accept() {
        let (client, server) = pair();
        client.close();
        client.closed().await;
        assert!(client.is_closed());
        assert!(server.accept().await.is_err());
        assert!(client.open().await.is_err());
    }

    #[test]
    fn config_from_metadata_clamps() {
        let md = Metadata::from_pairs([("mux.maxStreams", "100000"), ("mux.maxFrameSize", "16384")]);
        let cfg = MuxConfig::from_metadata(&md);
        assert_eq!(cfg.max_streams, MAX_STREAMS_LIMIT);
        assert_eq!(cfg.max_frame_size, Some(16384));
    }
}
