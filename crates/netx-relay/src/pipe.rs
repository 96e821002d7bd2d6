//! Shared tail of every handler: respond, wrap, account, relay.

use std::sync::Arc;

use bytes::BytesMut;
use netx_core::Conn;
use netx_core::io::{LimitedStream, PrefixedWriter, TransferStats, TransportOptions, transport};
use netx_core::limiter::TrafficLimiter;
use netx_core::net::AsyncStream;
use netx_core::observer::{ClientStats, HandlerStats};
use netx_metrics::record_transfer_bytes;
use netx_proto::{ProtoError, Response, encode_response, write_response};
use tracing::debug;

use crate::error::RelayError;

/// Replace the stream under `conn`, keeping its addresses.
pub(crate) fn layered<S: AsyncStream>(conn: Conn, f: impl FnOnce(Conn) -> S) -> Conn {
    let (local, peer) = (conn.local_addr(), conn.peer_addr());
    Conn::new(f(conn)).with_local_addr(local).with_peer_addr(peer)
}

/// Send `resp` now, or hold it back and send it with the first payload.
pub(crate) async fn respond(
    mut conn: Conn,
    resp: &Response,
    nodelay: bool,
) -> Result<Conn, RelayError> {
    if nodelay {
        write_response(&mut conn, resp).await?;
        return Ok(conn);
    }
    let mut header = BytesMut::new();
    encode_response(&mut header, resp).map_err(ProtoError::Write)?;
    let header = header.freeze();
    Ok(layered(conn, move |c| PrefixedWriter::new(c, header)))
}

/// Feeds byte counts into the client's counters and the service metrics.
struct ClientRecorder<'a> {
    service: &'a str,
    client: &'a ClientStats,
}

impl TransferStats for ClientRecorder<'_> {
    #[inline]
    fn record_up(&self, bytes: u64) {
        self.client.add_input(bytes);
        record_transfer_bytes(self.service, "input", bytes);
    }

    #[inline]
    fn record_down(&self, bytes: u64) {
        self.client.add_output(bytes);
        record_transfer_bytes(self.service, "output", bytes);
    }
}

/// Counts one open connection for as long as it lives.
struct ConnGuard(Arc<ClientStats>);

impl ConnGuard {
    fn open(stats: Arc<ClientStats>) -> Self {
        stats.conn_opened();
        Self(stats)
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.conn_closed();
    }
}

/// Relays a client connection to its upstream with limits and stats.
#[derive(Clone)]
pub(crate) struct Pipe {
    pub service: String,
    pub stats: Arc<HandlerStats>,
    pub traffic: Option<Arc<dyn TrafficLimiter>>,
    pub opts: TransportOptions,
}

impl Pipe {
    /// `client` keys both the traffic budget and the stats entry.
    pub async fn run(&self, conn: Conn, upstream: Conn, client: &str) -> Result<(), RelayError> {
        let guard = ConnGuard::open(self.stats.client(client));
        let conn = match &self.traffic {
            Some(tl) => {
                let (rl, wl) = (tl.in_limiter(client), tl.out_limiter(client));
                if rl.is_some() || wl.is_some() {
                    layered(conn, |c| LimitedStream::new(c, rl, wl))
                } else {
                    conn
                }
            }
            None => conn,
        };

        let peer = conn.peer_display();
        let dst = upstream.peer_display();
        debug!(peer = %peer, dst = %dst, "relay started");
        let recorder = ClientRecorder {
            service: &self.service,
            client: &guard.0,
        };
        match transport(conn, upstream, self.opts, &recorder).await {
            Ok((up, down)) => {
                debug!(peer = %peer, dst = %dst, up, down, "relay finished");
                Ok(())
            }
            Err(e) => {
                guard.0.add_error();
                Err(e.into())
            }
        }
    }
}
