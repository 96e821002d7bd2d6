//! Concrete transports for netx.
//!
//! Client side, these are the dialers and connectors that chain nodes are
//! built from; server side, the acceptors services wrap inbound TCP with.
//!
//! # Transports
//!
//! - [`tcp`]: Plain TCP dialer.
//! - [`tls`]: TLS dialer and acceptor (file-based or self-signed certificates).
//! - [`forward`]: Connector for nodes that are themselves the destination.

pub mod error;
pub mod forward;
pub mod tcp;
pub mod tls;

use std::future::Future;
use std::pin::Pin;

use netx_core::Conn;
use tokio::net::TcpStream;

pub use error::TransportError;
pub use forward::ForwardConnector;
pub use tcp::TcpDialer;
pub use tls::{TlsAcceptor, TlsDialer, TlsFiles};

/// Wraps an accepted TCP connection for a service.
pub trait Acceptor: Send + Sync + 'static {
    fn accept(
        &self,
        tcp: TcpStream,
    ) -> Pin<Box<dyn Future<Output = Result<Conn, TransportError>> + Send + '_>>;
}

/// Passes the raw TCP stream through.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainAcceptor;

impl Acceptor for PlainAcceptor {
    fn accept(
        &self,
        tcp: TcpStream,
    ) -> Pin<Box<dyn Future<Output = Result<Conn, TransportError>> + Send + '_>> {
        Box::pin(async move { Ok(Conn::from_tcp(tcp)) })
    }
}
