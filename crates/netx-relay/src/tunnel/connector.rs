//! Tunnel protocol client: the connector behind chain nodes of type
//! `tunnel`.

use std::net::SocketAddr;

use async_trait::async_trait;
use netx_chain::{BindOptions, ChainError, Connector, Listener};
use netx_core::io::DatagramStream;
use netx_core::{Conn, Metadata, Network};
use netx_proto::{
    Address, CMD_BIND, CMD_CONNECT, ConnectorId, FLAG_UDP, Feature, Features, Request, TunnelId,
};
use tracing::{debug, info};

use crate::connector::{BindListener, ConnectorOptions, Credentials, exchange, within};
use crate::error::RelayError;
use crate::mux::MuxSession;
use crate::pipe::layered;

const UNSPECIFIED: &str = "0.0.0.0:0";

#[derive(Debug, Clone)]
pub struct TunnelConnector {
    tunnel: TunnelId,
    weight: Option<u8>,
    auth: Option<Credentials>,
    opts: ConnectorOptions,
}

impl TunnelConnector {
    pub fn new(tunnel: TunnelId, opts: ConnectorOptions) -> Self {
        Self {
            tunnel,
            weight: None,
            auth: None,
            opts,
        }
    }

    /// Reads `tunnel.id` (required), `tunnel.weight` and the shared
    /// connector keys.
    pub fn from_metadata(md: &Metadata) -> Result<Self, RelayError> {
        let raw = md.get_string("tunnel.id");
        let tunnel = raw
            .parse::<TunnelId>()
            .ok()
            .filter(|t| !t.is_zero())
            .ok_or_else(|| RelayError::Config(format!("invalid tunnel id {raw:?}")))?;
        let weight = match md.get_int("tunnel.weight") {
            w if w > 0 => Some(w.min(i64::from(u8::MAX)) as u8),
            _ => None,
        };
        Ok(Self {
            tunnel,
            weight,
            auth: None,
            opts: ConnectorOptions::from_metadata(md),
        })
    }

    pub fn with_weight(mut self, weight: u8) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn tunnel(&self) -> TunnelId {
        self.tunnel
    }

    pub fn weight(&self) -> Option<u8> {
        self.weight
    }

    fn request(&self, cmd: u8, network: Network, src: &str, dst: &str, weight: Option<u8>) -> Request {
        let mut req = Request::new(cmd);
        if network.is_udp() {
            req.cmd |= FLAG_UDP;
            req = req.with(Feature::network(Network::Udp));
        }
        if let Some(auth) = &self.auth {
            req = req.with(auth.feature());
        }
        for addr in [src, dst] {
            if let Some(a) = Address::parse(addr) {
                req = req.with(Feature::Addr(a));
            }
        }
        req.with(Feature::Tunnel {
            id: self.tunnel.into_bytes(),
            weight,
        })
    }

    async fn connect_tunnel(&self, mut conn: Conn, network: Network, address: &str) -> Result<Conn, RelayError> {
        let src = conn
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| UNSPECIFIED.to_string());
        let req = self.request(CMD_CONNECT, network, &src, address, None);
        within(self.opts.connect_timeout, exchange(&mut conn, &req)).await?;
        debug!(network = %network, dst = %address, tunnel = %self.tunnel, "tunnel connect");

        Ok(match network {
            Network::Udp => layered(conn, DatagramStream::new),
            _ => conn,
        })
    }

    async fn bind_tunnel(&self, mut conn: Conn, network: Network, address: &str) -> Result<Box<dyn Listener>, RelayError> {
        let src = conn
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| UNSPECIFIED.to_string());
        let req = self.request(CMD_BIND, network, &src, address, self.weight);
        let resp = match within(self.opts.connect_timeout, exchange(&mut conn, &req)).await {
            Ok(resp) => resp,
            Err(RelayError::Rejected(status)) => {
                return Err(RelayError::BadRequest(format!(
                    "{status}: create tunnel {} failed",
                    self.tunnel
                )));
            }
            Err(e) => return Err(e),
        };

        let addr = resp.addrs().first().map(|a| a.to_string()).unwrap_or_default();
        let cid = resp.tunnel().map(|(id, _)| ConnectorId::from_bytes(id));
        info!(
            addr = %addr,
            network = %network,
            tunnel = %self.tunnel,
            connector = ?cid.map(|c| c.to_string()),
            "create tunnel OK"
        );

        let bound = addr.parse::<SocketAddr>().ok();
        let session = MuxSession::server(conn, &self.opts.mux);
        Ok(Box::new(BindListener::new(network, bound, session)))
    }
}

#[async_trait]
impl Connector for TunnelConnector {
    async fn connect(&self, conn: Conn, network: Network, address: &str) -> Result<Conn, ChainError> {
        Ok(self.connect_tunnel(conn, network, address).await?)
    }

    async fn bind(
        &self,
        conn: Conn,
        network: Network,
        address: &str,
        _opts: &BindOptions,
    ) -> Result<Box<dyn Listener>, ChainError> {
        Ok(self.bind_tunnel(conn, network, address).await?)
    }
}
