use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use netx_chain::Listener;
use netx_core::io::DatagramStream;
use netx_core::{Conn, Network};
use netx_proto::{Features, Status, read_response};
use tracing::{debug, warn};

use crate::mux::{MuxSession, Session};
use crate::pipe::layered;

/// Client side of a remote bind: every stream the relay opens on the
/// session is one peer that connected to the bound port.
pub struct BindListener {
    network: Network,
    addr: Option<SocketAddr>,
    session: Arc<MuxSession>,
}

impl BindListener {
    pub fn new(network: Network, addr: Option<SocketAddr>, session: MuxSession) -> Self {
        Self {
            network,
            addr,
            session: Arc::new(session),
        }
    }

    /// Second reply on each stream: `OK`, then the peer address and an
    /// optional target host.
    async fn peer_conn(&self, mut stream: Conn) -> io::Result<Conn> {
        let resp = read_response(&mut stream)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        if resp.status != Status::Ok {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("peer connect failed: {}", resp.status),
            ));
        }

        let addrs = resp.addrs();
        let peer = addrs
            .first()
            .and_then(|a| a.to_string().parse::<SocketAddr>().ok());
        if let Some(host) = addrs.get(1) {
            debug!(peer = ?peer, host = %host, "peer connected");
        }

        let conn = stream.with_local_addr(self.addr).with_peer_addr(peer);
        Ok(match self.network {
            Network::Udp => layered(conn, DatagramStream::new),
            _ => conn,
        })
    }
}

#[async_trait]
impl Listener for BindListener {
    async fn accept(&self) -> io::Result<Conn> {
        loop {
            let stream = self.session.accept().await?;
            match self.peer_conn(stream).await {
                Ok(conn) => return Ok(conn),
                Err(e) => warn!(bind = ?self.addr, error = %e, "get peer failed"),
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    fn close(&self) {
        self.session.close();
    }
}

impl std::fmt::Debug for BindListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindListener")
            .field("network", &self.network)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}
