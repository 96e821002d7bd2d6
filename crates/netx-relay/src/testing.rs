//! Test doubles shared by the handler and tunnel tests.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use netx_core::Conn;
use tokio_util::sync::CancellationToken;

use crate::mux::Session;

/// Session that never carries streams; only its lifecycle is observable.
#[derive(Default)]
pub struct FakeSession {
    closed: AtomicBool,
    done: CancellationToken,
}

#[async_trait]
impl Session for FakeSession {
    async fn open(&self) -> io::Result<Conn> {
        Err(io::ErrorKind::NotConnected.into())
    }

    async fn accept(&self) -> io::Result<Conn> {
        self.done.cancelled().await;
        Err(io::ErrorKind::ConnectionAborted.into())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.done.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        self.done.cancelled().await;
    }
}

/// Loopback TCP server that echoes every byte back.
pub async fn echo_server() -> std::net::SocketAddr {
    let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = ln.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Node transport for tests that only need a node's address.
pub fn unused_transport() -> netx_chain::Transport {
    let part = std::sync::Arc::new(Unused);
    netx_chain::Transport::new(part.clone(), part)
}

struct Unused;

#[async_trait]
impl netx_chain::Dialer for Unused {
    async fn dial(&self, addr: &str) -> Result<Conn, netx_chain::ChainError> {
        Err(netx_chain::ChainError::dial(addr, io::ErrorKind::Unsupported.into()))
    }
}

#[async_trait]
impl netx_chain::Connector for Unused {
    async fn connect(
        &self,
        _conn: Conn,
        _network: netx_core::Network,
        _address: &str,
    ) -> Result<Conn, netx_chain::ChainError> {
        Err(netx_chain::ChainError::Unsupported("connect"))
    }
}
