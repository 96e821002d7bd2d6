//! Relay protocol client: the connector behind chain nodes of type `relay`.

mod conn;
mod listener;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use netx_chain::{BindOptions, ChainError, Connector, Listener, UdpListenerAdapter};
use netx_core::io::{DatagramStream, PrefixedWriter, UdpTunConn};
use netx_core::net::udp::{UdpListener, UdpListenerConfig};
use netx_core::{Conn, Metadata, Network};
use netx_proto::{
    CMD_BIND, CMD_CONNECT, FLAG_UDP, Feature, Features, ProtoError, Request, Response, Status,
    encode_request, read_response, write_request,
};
use tracing::{debug, info};

pub use listener::BindListener;

use crate::error::RelayError;
use crate::mux::{MuxConfig, MuxSession};
use crate::pipe::layered;

pub(crate) use conn::ResponseReader;

#[derive(Debug, Clone, Default)]
pub struct ConnectorOptions {
    /// Bounds the request/response exchange. `None` waits forever.
    pub connect_timeout: Option<Duration>,
    /// Exchange request and response before returning; otherwise the request
    /// rides on the first write and the response is read on the first read.
    pub nodelay: bool,
    pub mux: MuxConfig,
}

impl ConnectorOptions {
    /// Reads `connectTimeout`, `nodelay` and `mux.*`.
    pub fn from_metadata(md: &Metadata) -> Self {
        let t = md.get_duration("connectTimeout");
        Self {
            connect_timeout: (!t.is_zero()).then_some(t),
            nodelay: md.get_bool("nodelay"),
            mux: MuxConfig::from_metadata(md),
        }
    }
}

/// Credentials sent in the user-auth feature.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub(crate) fn feature(&self) -> Feature {
        Feature::UserAuth {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Run `fut` under the optional connect timeout.
pub(crate) async fn within<T>(
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<T, RelayError>>,
) -> Result<T, RelayError> {
    match timeout {
        Some(t) => tokio::time::timeout(t, fut)
            .await
            .map_err(|_| RelayError::Timeout(t))?,
        None => fut.await,
    }
}

/// Write `req` and read the reply; a non-OK status is an error.
pub(crate) async fn exchange(conn: &mut Conn, req: &Request) -> Result<Response, RelayError> {
    write_request(conn, req).await?;
    let resp = read_response(conn).await?;
    if resp.status != Status::Ok {
        return Err(RelayError::Rejected(resp.status));
    }
    Ok(resp)
}

/// First address feature of a bind reply.
pub(crate) fn bound_addr(resp: &Response) -> Option<SocketAddr> {
    resp.addrs()
        .first()
        .and_then(|a| a.to_string().parse().ok())
}

#[derive(Debug, Clone, Default)]
pub struct RelayConnector {
    auth: Option<Credentials>,
    opts: ConnectorOptions,
}

impl RelayConnector {
    pub fn new(opts: ConnectorOptions) -> Self {
        Self { auth: None, opts }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    fn request(&self, cmd: u8, network: Network, address: &str) -> Result<Request, RelayError> {
        let mut req = Request::new(cmd);
        if network.is_udp() {
            req.cmd |= FLAG_UDP;
            req = req.with(Feature::network(Network::Udp));
        }
        if let Some(auth) = &self.auth {
            req = req.with(auth.feature());
        }
        if !address.is_empty() {
            let addr = netx_proto::Address::parse(address)
                .ok_or_else(|| RelayError::BadRequest(format!("invalid address {address}")))?;
            req = req.with(Feature::Addr(addr));
        }
        Ok(req)
    }

    async fn connect_relay(
        &self,
        mut conn: Conn,
        network: Network,
        address: &str,
    ) -> Result<Conn, RelayError> {
        let req = self.request(CMD_CONNECT, network, address)?;
        let conn = if self.opts.nodelay {
            within(self.opts.connect_timeout, exchange(&mut conn, &req)).await?;
            conn
        } else {
            let mut header = BytesMut::new();
            encode_request(&mut header, &req).map_err(ProtoError::Write)?;
            let header = header.freeze();
            layered(conn, move |c| ResponseReader::new(PrefixedWriter::new(c, header)))
        };
        debug!(network = %network, dst = %address, nodelay = self.opts.nodelay, "relay connect");

        Ok(match network {
            Network::Udp => layered(conn, DatagramStream::new),
            _ => conn,
        })
    }

    async fn bind_relay(
        &self,
        mut conn: Conn,
        network: Network,
        address: &str,
        opts: &BindOptions,
    ) -> Result<Box<dyn Listener>, RelayError> {
        let req = self.request(CMD_BIND, network, address)?;
        let resp = within(self.opts.connect_timeout, exchange(&mut conn, &req)).await?;
        let bound = bound_addr(&resp);
        info!(network = %network, bind = ?bound, "relay bind OK");

        if network.is_udp() {
            let pc = Arc::new(UdpTunConn::new(conn, bound));
            let ln = UdpListener::new(
                pc,
                UdpListenerConfig {
                    backlog: opts.backlog,
                    queue_size: opts.udp_queue_size,
                    read_buffer_size: opts.udp_buffer_size,
                    ttl: opts.udp_conn_ttl,
                    keepalive: true,
                },
            );
            return Ok(Box::new(UdpListenerAdapter::new(ln)));
        }

        let session = MuxSession::server(conn, &self.opts.mux);
        Ok(Box::new(BindListener::new(network, bound, session)))
    }
}

#[async_trait]
impl Connector for RelayConnector {
    async fn connect(
        &self,
        conn: Conn,
        network: Network,
        address: &str,
    ) -> Result<Conn, ChainError> {
        Ok(self.connect_relay(conn, network, address).await?)
    }

    async fn bind(
        &self,
        conn: Conn,
        network: Network,
        address: &str,
        opts: &BindOptions,
    ) -> Result<Box<dyn Listener>, ChainError> {
        Ok(self.bind_relay(conn, network, address, opts).await?)
    }
}
