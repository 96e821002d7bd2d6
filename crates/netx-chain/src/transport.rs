//! Dialer, connector and listener contracts.
//!
//! A node reaches the next step of a route in two layers: its [`Dialer`]
//! opens (and optionally handshakes) a transport connection, and its
//! [`Connector`] speaks the proxy protocol on that connection to reach an
//! address behind the node. Nested legs reuse the previous node's connector
//! to reach the next node, then run the next node's dialer handshake.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use netx_core::{
    Conn, DEFAULT_UDP_BACKLOG, DEFAULT_UDP_BUFFER_SIZE, DEFAULT_UDP_CONN_TTL_SECS,
    DEFAULT_UDP_QUEUE_SIZE, Network,
};

use crate::error::ChainError;

/// Options for [`Connector::bind`] and route binds.
#[derive(Debug, Clone)]
pub struct BindOptions {
    pub backlog: usize,
    /// Ask the peer to multiplex accepted connections over one session.
    pub mux: bool,
    pub udp_conn_ttl: Duration,
    pub udp_buffer_size: usize,
    pub udp_queue_size: usize,
}

impl Default for BindOptions {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_UDP_BACKLOG,
            mux: false,
            udp_conn_ttl: Duration::from_secs(DEFAULT_UDP_CONN_TTL_SECS),
            udp_buffer_size: DEFAULT_UDP_BUFFER_SIZE,
            udp_queue_size: DEFAULT_UDP_QUEUE_SIZE,
        }
    }
}

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a transport connection to an already resolved `addr`.
    async fn dial(&self, addr: &str) -> Result<Conn, ChainError>;

    /// Transport setup on a dialed or tunnelled connection (TLS, etc.).
    async fn handshake(&self, conn: Conn) -> Result<Conn, ChainError> {
        Ok(conn)
    }

    fn multiplex(&self) -> bool {
        false
    }
}

#[async_trait]
impl<D: Dialer + ?Sized> Dialer for Arc<D> {
    async fn dial(&self, addr: &str) -> Result<Conn, ChainError> {
        (**self).dial(addr).await
    }

    async fn handshake(&self, conn: Conn) -> Result<Conn, ChainError> {
        (**self).handshake(conn).await
    }

    fn multiplex(&self) -> bool {
        (**self).multiplex()
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Ask the node at the other end of `conn` to connect to `address`.
    async fn connect(
        &self,
        conn: Conn,
        network: Network,
        address: &str,
    ) -> Result<Conn, ChainError>;

    /// Ask the node to listen on `address` and hand back accepted peers.
    async fn bind(
        &self,
        _conn: Conn,
        _network: Network,
        _address: &str,
        _opts: &BindOptions,
    ) -> Result<Box<dyn Listener>, ChainError> {
        Err(ChainError::Unsupported("bind"))
    }
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(
        &self,
        conn: Conn,
        network: Network,
        address: &str,
    ) -> Result<Conn, ChainError> {
        (**self).connect(conn, network, address).await
    }

    async fn bind(
        &self,
        conn: Conn,
        network: Network,
        address: &str,
        opts: &BindOptions,
    ) -> Result<Box<dyn Listener>, ChainError> {
        (**self).bind(conn, network, address, opts).await
    }
}

#[async_trait]
pub trait Listener: Send + Sync {
    async fn accept(&self) -> io::Result<Conn>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Stop accepting; pending and future `accept` calls fail.
    fn close(&self);
}

#[async_trait]
impl<L: Listener + ?Sized> Listener for Box<L> {
    async fn accept(&self) -> io::Result<Conn> {
        (**self).accept().await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        (**self).local_addr()
    }

    fn close(&self) {
        (**self).close()
    }
}

#[async_trait]
impl<L: Listener + ?Sized> Listener for Arc<L> {
    async fn accept(&self) -> io::Result<Conn> {
        (**self).accept().await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        (**self).local_addr()
    }

    fn close(&self) {
        (**self).close()
    }
}

/// The dialer and connector of one node.
#[derive(Clone)]
pub struct Transport {
    dialer: Arc<dyn Dialer>,
    connector: Arc<dyn Connector>,
}

impl Transport {
    pub fn new(dialer: Arc<dyn Dialer>, connector: Arc<dyn Connector>) -> Self {
        Self { dialer, connector }
    }

    pub async fn dial(&self, addr: &str) -> Result<Conn, ChainError> {
        self.dialer.dial(addr).await
    }

    pub async fn handshake(&self, conn: Conn) -> Result<Conn, ChainError> {
        self.dialer.handshake(conn).await
    }

    pub async fn connect(
        &self,
        conn: Conn,
        network: Network,
        address: &str,
    ) -> Result<Conn, ChainError> {
        self.connector.connect(conn, network, address).await
    }

    pub async fn bind(
        &self,
        conn: Conn,
        network: Network,
        address: &str,
        opts: &BindOptions,
    ) -> Result<Box<dyn Listener>, ChainError> {
        self.connector.bind(conn, network, address, opts).await
    }

    pub fn multiplex(&self) -> bool {
        self.dialer.multiplex()
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("multiplex", &self.multiplex())
            .finish_non_exhaustive()
    }
}
