//! Public HTTP entrypoint: picks the tunnel from the request's `Host`
//! header and splices the connection onto it.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use netx_core::ingress::Ingress;
use netx_core::net::split_host_port;
use netx_core::{Conn, DEFAULT_ACCEPT_BACKOFF_MS, DEFAULT_ENTRYPOINT_MAX_HEADER_BYTES, Network};
use netx_proto::{Address, CMD_CONNECT, Feature, Request, TunnelId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use super::connect::peer_response;
use super::dialer::TunnelDialer;
use crate::connector::exchange;
use crate::error::RelayError;
use crate::pipe::Pipe;

#[derive(Clone)]
pub struct Entrypoint {
    dialer: TunnelDialer,
    ingress: Option<Arc<dyn Ingress>>,
    pipe: Pipe,
    max_header_bytes: usize,
}

/// Index just past the blank line ending an HTTP head.
fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// `Host` header of an HTTP head, with `:80` added when no port is given.
pub(crate) fn sniff_host(head: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(head).ok()?;
    let host = text.split("\r\n").skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("host")
            .then(|| value.trim().to_string())
    })?;
    if host.is_empty() {
        return None;
    }
    Some(match split_host_port(&host) {
        Ok(_) => host,
        Err(_) if host.starts_with('[') => format!("{host}:80"),
        Err(_) if host.contains(':') => format!("[{host}]:80"),
        Err(_) => format!("{host}:80"),
    })
}

async fn http_error(conn: &mut Conn, code: u16, reason: &str) {
    let resp = format!("HTTP/1.1 {code} {reason}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
    if let Err(e) = conn.write_all(resp.as_bytes()).await {
        debug!(code, error = %e, "failed to write http error");
    }
}

impl Entrypoint {
    pub fn new(dialer: TunnelDialer, pipe: Pipe) -> Self {
        Self {
            dialer,
            ingress: None,
            pipe,
            max_header_bytes: DEFAULT_ENTRYPOINT_MAX_HEADER_BYTES,
        }
    }

    pub fn with_ingress(mut self, ingress: Option<Arc<dyn Ingress>>) -> Self {
        self.ingress = ingress;
        self
    }

    pub fn with_max_header_bytes(mut self, n: usize) -> Self {
        self.max_header_bytes = n.max(64);
        self
    }

    /// Accept until `shutdown` fires; each connection runs on its own task.
    pub async fn serve(self, ln: TcpListener, shutdown: CancellationToken) {
        let backoff = Duration::from_millis(DEFAULT_ACCEPT_BACKOFF_MS);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                res = ln.accept() => match res {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let ep = self.clone();
                        let span = info_span!("ep", peer = %peer);
                        tokio::spawn(
                            async move {
                                if let Err(e) = ep.handle(Conn::from_tcp(stream)).await {
                                    debug!(error = %e, "entrypoint connection ended");
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "entrypoint accept failed");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        debug!("entrypoint stopped");
    }

    async fn read_head(&self, conn: &mut Conn) -> Result<BytesMut, RelayError> {
        let mut buf = BytesMut::with_capacity(1024);
        loop {
            if head_end(&buf).is_some() {
                return Ok(buf);
            }
            if buf.len() >= self.max_header_bytes {
                return Err(RelayError::BadRequest("http header too large".into()));
            }
            if conn.read_buf(&mut buf).await? == 0 {
                return Err(RelayError::BadRequest("connection closed before http header".into()));
            }
        }
    }

    pub async fn handle(&self, mut conn: Conn) -> Result<(), RelayError> {
        let head = match self.read_head(&mut conn).await {
            Ok(h) => h,
            Err(e) => {
                http_error(&mut conn, 400, "Bad Request").await;
                return Err(e);
            }
        };
        let Some(host) = sniff_host(&head) else {
            http_error(&mut conn, 400, "Bad Request").await;
            return Err(RelayError::BadRequest("missing host header".into()));
        };

        let tunnel = match &self.ingress {
            Some(ingress) => ingress
                .get_rule(&host)
                .await
                .and_then(|r| r.endpoint.parse::<TunnelId>().ok())
                .filter(|t| !t.is_zero()),
            None => None,
        };
        let Some(tunnel) = tunnel else {
            http_error(&mut conn, 503, "Service Unavailable").await;
            return Err(RelayError::NoRoute(host));
        };
        if tunnel.is_private() {
            http_error(&mut conn, 403, "Forbidden").await;
            return Err(RelayError::Forbidden(format!("tunnel {tunnel} is private")));
        }

        let dialed = match self.dialer.dial(Network::Tcp, &tunnel).await {
            Ok(d) => d,
            Err(e) => {
                http_error(&mut conn, 502, "Bad Gateway").await;
                return Err(e);
            }
        };
        let mut cc = dialed.conn;
        let src = conn.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        debug!(host = %host, tunnel = %tunnel, node = %dialed.node, "entrypoint dispatch");

        if dialed.node == self.dialer.node() {
            netx_proto::write_response(&mut cc, &peer_response(&src, &host)).await?;
        } else {
            let mut req = Request::new(CMD_CONNECT);
            for addr in [src.as_str(), host.as_str()] {
                if let Some(a) = Address::parse(addr) {
                    req = req.with(Feature::Addr(a));
                }
            }
            req = req.with(Feature::tunnel(tunnel));
            if let Err(e) = exchange(&mut cc, &req).await {
                http_error(&mut conn, 502, "Bad Gateway").await;
                return Err(e);
            }
        }

        cc.write_all(&head).await?;
        let client = netx_core::net::host_of(&src).to_string();
        self.pipe.run(conn, cc, &client).await
    }
}

impl std::fmt::Debug for Entrypoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entrypoint")
            .field("dialer", &self.dialer)
            .field("max_header_bytes", &self.max_header_bytes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_header_gets_default_port() {
        let head = b"GET / HTTP/1.1\r\nUser-Agent: t\r\nhost: Example.com\r\n\r\n";
        assert_eq!(sniff_host(head).as_deref(), Some("Example.com:80"));
        let head = b"GET / HTTP/1.1\r\nHost: a.example.com:8080\r\n\r\n";
        assert_eq!(sniff_host(head).as_deref(), Some("a.example.com:8080"));
        let head = b"GET / HTTP/1.1\r\nHost: [::1]\r\n\r\n";
        assert_eq!(sniff_host(head).as_deref(), Some("[::1]:80"));
    }

    #[test]
    fn missing_host_header() {
        assert!(sniff_host(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n").is_none());
        assert!(sniff_host(b"Host: first-line-is-not-a-header\r\n\r\n").is_none());
    }

    #[test]
    fn head_end_finds_blank_line() {
        assert_eq!(head_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(head_end(b"GET / HTTP/1.1\r\n"), None);
    }
}
