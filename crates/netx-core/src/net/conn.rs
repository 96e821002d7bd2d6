use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Marker trait for byte streams usable as connections.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> AsyncStream for T {}

/// A type-erased, bidirectional connection with optional endpoint addresses.
///
/// Each chain leg wraps the previous one, so a `Conn` returned by a route may
/// be several protocol layers deep. The addresses describe the outermost
/// logical endpoints and are informational only.
pub struct Conn {
    io: Box<dyn AsyncStream>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl Conn {
    pub fn new<S: AsyncStream>(io: S) -> Self {
        Self {
            io: Box::new(io),
            local_addr: None,
            peer_addr: None,
        }
    }

    /// Wrap a TCP stream, keeping its socket addresses.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        Self {
            io: Box::new(stream),
            local_addr,
            peer_addr,
        }
    }

    /// Replace the inner stream, keeping the addresses of `self`.
    pub fn wrap<S: AsyncStream>(self, io: S) -> Self {
        Self {
            io: Box::new(io),
            local_addr: self.local_addr,
            peer_addr: self.peer_addr,
        }
    }

    pub fn with_local_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.local_addr = addr;
        self
    }

    pub fn with_peer_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.peer_addr = addr;
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Peer address for log lines; `"-"` when unknown.
    pub fn peer_display(&self) -> String {
        self.peer_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    pub fn local_display(&self) -> String {
        self.local_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string())
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_shutdown(cx)
    }
}
