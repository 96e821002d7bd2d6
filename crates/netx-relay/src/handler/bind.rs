//! BIND: open a listener on the relay host and tunnel every inbound peer
//! back to the client through a mux session (TCP), or relay datagrams over
//! the request connection (UDP).

use std::sync::Arc;
use std::time::Duration;

use netx_chain::direct::normalize_bind_addr;
use netx_core::io::UdpTunConn;
use netx_core::{Conn, DEFAULT_ACCEPT_BACKOFF_MS, Network, PacketConn};
use netx_proto::{Feature, Response, Status, write_response};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::Instant;
use tracing::{Instrument, debug, info, info_span, warn};

use super::{Parsed, RelayHandler, reply};
use crate::error::RelayError;
use crate::mux::{MuxSession, Session};
use crate::pipe::Pipe;
use crate::udp::UdpRelay;

impl RelayHandler {
    pub(super) async fn handle_bind(&self, mut conn: Conn, req: Parsed) -> Result<(), RelayError> {
        if !self.opts.enable_bind {
            warn!(peer = %conn.peer_display(), "relay: BIND is disabled");
            reply(&mut conn, Status::Forbidden).await;
            return Err(RelayError::Forbidden("BIND is disabled".into()));
        }
        match req.network {
            Network::Tcp => self.bind_tcp(conn, &req.address).await,
            Network::Udp => self.bind_udp(conn, &req.address).await,
            other => {
                reply(&mut conn, Status::BadRequest).await;
                Err(RelayError::BadRequest(format!("cannot bind {other}")))
            }
        }
    }

    async fn bind_tcp(&self, mut conn: Conn, address: &str) -> Result<(), RelayError> {
        let ln = match TcpListener::bind(normalize_bind_addr(address)).await {
            Ok(ln) => ln,
            Err(e) => {
                warn!(addr = %address, error = %e, "bind failed");
                reply(&mut conn, Status::ServiceUnavailable).await;
                return Err(e.into());
            }
        };
        let bound = ln.local_addr()?;
        let resp = Response::new(Status::Ok).with(Feature::Addr(bound.into()));
        write_response(&mut conn, &resp).await?;

        let service = format!("{}-ep-{}", self.service, bound);
        let session = Arc::new(MuxSession::client(conn, &self.opts.mux));
        info!(service = %service, bind = %bound, "bind on tcp OK");

        // Streams opened by the client carry nothing; closing them is all
        // there is to do. The loop ends with the session.
        let drain = {
            let session = session.clone();
            tokio::spawn(async move {
                while let Ok(stream) = session.accept().await {
                    drop(stream);
                }
                session.close();
            })
        };

        let pipe = self.pipe();
        let backoff = Duration::from_millis(DEFAULT_ACCEPT_BACKOFF_MS);
        loop {
            tokio::select! {
                biased;
                _ = session.closed() => break,
                res = ln.accept() => match res {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let session = session.clone();
                        let pipe = pipe.clone();
                        let span = info_span!("ep", service = %service, peer = %peer);
                        tokio::spawn(
                            async move {
                                if let Err(e) = serve_endpoint(session, Conn::from_tcp(stream), pipe).await {
                                    debug!(error = %e, "endpoint connection ended");
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        warn!(service = %service, error = %e, "accept failed");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        drain.abort();
        session.close();
        info!(service = %service, "bind closed");
        Ok(())
    }

    async fn bind_udp(&self, mut conn: Conn, address: &str) -> Result<(), RelayError> {
        let socket = match UdpSocket::bind(normalize_bind_addr(address)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(addr = %address, error = %e, "bind failed");
                reply(&mut conn, Status::ServiceUnavailable).await;
                return Err(e.into());
            }
        };
        let bound = socket.local_addr()?;
        let resp = Response::new(Status::Ok).with(Feature::Addr(bound.into()));
        write_response(&mut conn, &resp).await?;
        info!(service = %self.service, bind = %bound, "bind on udp OK");

        let peer = conn.peer_display();
        let local = conn.local_addr();
        let tun: Arc<dyn PacketConn> = Arc::new(UdpTunConn::new(conn, local));
        let relay = UdpRelay::new(tun, Arc::new(socket))
            .with_bypass(self.bypass.clone())
            .with_buffer_size(self.opts.udp_buffer_size);

        let started = Instant::now();
        if let Err(e) = relay.run().await {
            debug!(peer = %peer, bind = %bound, error = %e, "udp relay ended");
        }
        debug!(peer = %peer, bind = %bound, duration = ?started.elapsed(), "udp bind closed");
        Ok(())
    }
}

/// Hands one peer of a bound listener to the client: a fresh stream, a
/// response naming the peer, then the bytes.
async fn serve_endpoint(
    session: Arc<MuxSession>,
    conn: Conn,
    pipe: Pipe,
) -> Result<(), RelayError> {
    let peer = conn.peer_addr();
    info!("connection opened");
    let mut stream = session.open().await?;
    let mut resp = Response::new(Status::Ok);
    if let Some(peer) = peer {
        resp = resp.with(Feature::Addr(peer.into()));
    }
    write_response(&mut stream, &resp).await?;

    let client = peer.map(|p| p.ip().to_string()).unwrap_or_default();
    let res = pipe.run(conn, stream, &client).await;
    info!("connection closed");
    res
}
