use std::sync::Arc;
use std::time::Duration;

use netx_core::sd::ServiceDiscovery;
use netx_core::{Conn, Network};
use netx_metrics::record_tunnel_sd_fallback;
use netx_proto::{ConnectorId, TunnelId};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::pool::ConnectorPool;
use crate::error::RelayError;

/// A stream towards a tunnel client, or towards the node that holds one.
pub struct Dialed {
    pub conn: Conn,
    /// Node that owns the connector.
    pub node: String,
    /// Connector used, when the tunnel was reached through the local pool.
    pub connector: Option<ConnectorId>,
}

impl std::fmt::Debug for Dialed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialed")
            .field("node", &self.node)
            .field("connector", &self.connector.map(|c| c.to_string()))
            .finish_non_exhaustive()
    }
}

/// Opens streams on pooled connectors, falling back to another node found
/// through service discovery.
#[derive(Clone)]
pub struct TunnelDialer {
    node: String,
    pool: Arc<ConnectorPool>,
    sd: Option<Arc<dyn ServiceDiscovery>>,
    retries: usize,
    timeout: Duration,
}

impl TunnelDialer {
    pub fn new(node: impl Into<String>, pool: Arc<ConnectorPool>) -> Self {
        Self {
            node: node.into(),
            pool,
            sd: None,
            retries: netx_core::DEFAULT_TUNNEL_DIAL_RETRIES,
            timeout: Duration::from_secs(netx_core::DEFAULT_TUNNEL_DIAL_TIMEOUT_SECS),
        }
    }

    pub fn with_sd(mut self, sd: Option<Arc<dyn ServiceDiscovery>>) -> Self {
        self.sd = sd;
        self
    }

    /// Zero is treated as one attempt.
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub async fn dial(&self, network: Network, tunnel: &TunnelId) -> Result<Dialed, RelayError> {
        for attempt in 1..=self.retries {
            let Some(c) = self.pool.get(network, tunnel) else {
                break;
            };
            match c.session().open().await {
                Ok(conn) => {
                    debug!(tunnel = %tunnel, connector = %c.id(), attempt, "tunnel stream opened");
                    return Ok(Dialed {
                        conn,
                        node: c.node().to_string(),
                        connector: Some(c.id()),
                    });
                }
                Err(e) => {
                    warn!(tunnel = %tunnel, connector = %c.id(), attempt, error = %e, "open stream failed");
                    c.session().close();
                }
            }
        }

        let Some(sd) = &self.sd else {
            return Err(RelayError::TunnelNotAvailable);
        };
        let services = sd.get(&tunnel.to_string()).await.map_err(|e| {
            debug!(tunnel = %tunnel, error = %e, "sd lookup failed");
            RelayError::TunnelNotAvailable
        })?;
        let network_name = network.to_string();
        let service = services
            .into_iter()
            .find(|s| s.node != self.node && s.network == network_name && !s.address.is_empty())
            .ok_or(RelayError::TunnelNotAvailable)?;

        record_tunnel_sd_fallback();
        debug!(tunnel = %tunnel, node = %service.node, addr = %service.address, "dial tunnel via sd");
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&service.address))
            .await
            .map_err(|_| RelayError::Timeout(self.timeout))??;
        let _ = stream.set_nodelay(true);
        Ok(Dialed {
            conn: Conn::from_tcp(stream),
            node: service.node,
            connector: None,
        })
    }
}

impl std::fmt::Debug for TunnelDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelDialer")
            .field("node", &self.node)
            .field("retries", &self.retries)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::Session as _;
    use crate::testing::FakeSession;
    use crate::tunnel::pool::Connector;
    use netx_core::sd::{MemorySd, Service};
    use tokio::net::TcpListener;

    const TID: &str = "0f6ec2a8-6b1c-4a5e-9d2f-0c1d2e3f4a5b";

    #[tokio::test]
    async fn empty_pool_without_sd_is_unavailable() {
        let dialer = TunnelDialer::new("self", Arc::new(ConnectorPool::new()));
        let err = dialer.dial(Network::Tcp, &TID.parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, RelayError::TunnelNotAvailable));
    }

    #[tokio::test]
    async fn failed_open_closes_connector() {
        let pool = Arc::new(ConnectorPool::new());
        let tid: TunnelId = TID.parse().unwrap();
        let session = Arc::new(FakeSession::default());
        pool.add(
            tid,
            Arc::new(Connector::new(ConnectorId::new(), tid, "self", session.clone())),
            Duration::from_secs(15),
        );
        let dialer = TunnelDialer::new("self", pool.clone());
        assert!(dialer.dial(Network::Tcp, &tid).await.is_err());
        assert!(session.is_closed());
        assert!(pool.get(Network::Tcp, &tid).is_none());
    }

    #[tokio::test]
    async fn falls_back_to_other_node() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let sd = Arc::new(MemorySd::new(Duration::from_secs(60)));
        let tid: TunnelId = TID.parse().unwrap();
        for (node, address) in [("self", "127.0.0.1:1".to_string()), ("other", addr.to_string())] {
            sd.register(&Service {
                id: ConnectorId::new().to_string(),
                name: tid.to_string(),
                node: node.into(),
                network: "tcp".into(),
                address,
            })
            .await
            .unwrap();
        }

        let dialer = TunnelDialer::new("self", Arc::new(ConnectorPool::new()))
            .with_sd(Some(sd))
            .with_timeout(Duration::from_secs(2));
        let dialed = dialer.dial(Network::Tcp, &tid).await.unwrap();
        assert_eq!(dialed.node, "other");
        assert!(dialed.connector.is_none());
        assert_eq!(dialed.conn.peer_addr(), Some(addr));

        let err = dialer.dial(Network::Udp, &tid).await.unwrap_err();
        assert!(matches!(err, RelayError::TunnelNotAvailable));
    }
}
