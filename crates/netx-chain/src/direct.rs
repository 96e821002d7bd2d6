//! Dialing and binding without any intermediate node.

use std::sync::Arc;
use std::time::Duration;

use netx_core::net::udp::{UdpListener, UdpListenerConfig};
use netx_core::net::{UdpStream, split_host_port};
use netx_core::{Conn, DEFAULT_DIAL_TIMEOUT_SECS, DEFAULT_TCP_NO_DELAY, Network};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::debug;

use crate::error::ChainError;
use crate::listener::{TcpListenerAdapter, UdpListenerAdapter};
use crate::transport::{BindOptions, Listener};

/// The route used when a chain yields no nodes.
pub static DEFAULT_ROUTE: DirectRoute = DirectRoute::new(
    DEFAULT_TCP_NO_DELAY,
    Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS),
);

#[derive(Debug, Clone, Copy)]
pub struct DirectRoute {
    nodelay: bool,
    timeout: Duration,
}

impl DirectRoute {
    pub const fn new(nodelay: bool, timeout: Duration) -> Self {
        Self { nodelay, timeout }
    }

    pub async fn dial(&self, network: Network, address: &str) -> Result<Conn, ChainError> {
        debug!(network = %network, dst = %address, "direct dial");
        let fut = async {
            match network {
                Network::Tcp => {
                    let stream = TcpStream::connect(address)
                        .await
                        .map_err(|e| ChainError::dial(address, e))?;
                    if self.nodelay {
                        let _ = stream.set_nodelay(true);
                    }
                    Ok(Conn::from_tcp(stream))
                }
                Network::Udp => {
                    let target = tokio::net::lookup_host(address)
                        .await
                        .map_err(|e| ChainError::dial(address, e))?
                        .next()
                        .ok_or_else(|| {
                            ChainError::dial(
                                address,
                                std::io::Error::new(
                                    std::io::ErrorKind::AddrNotAvailable,
                                    "no address",
                                ),
                            )
                        })?;
                    let stream = UdpStream::connect(target)
                        .await
                        .map_err(|e| ChainError::dial(address, e))?;
                    let local = stream.local_addr();
                    Ok(Conn::new(stream)
                        .with_local_addr(local)
                        .with_peer_addr(Some(target)))
                }
                _ => Err(ChainError::Unsupported("network")),
            }
        };
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ChainError::Timeout(self.timeout))?
    }

    pub async fn bind(
        &self,
        network: Network,
        address: &str,
        opts: &BindOptions,
    ) -> Result<Box<dyn Listener>, ChainError> {
        let address = normalize_bind_addr(address);
        match network {
            Network::Tcp => {
                let listener = TcpListener::bind(&address)
                    .await
                    .map_err(|e| ChainError::dial(&address, e))?;
                Ok(Box::new(TcpListenerAdapter::new(listener, self.nodelay)))
            }
            Network::Udp => {
                let socket = UdpSocket::bind(&address)
                    .await
                    .map_err(|e| ChainError::dial(&address, e))?;
                let listener = UdpListener::new(
                    Arc::new(socket),
                    UdpListenerConfig {
                        backlog: opts.backlog,
                        queue_size: opts.udp_queue_size,
                        read_buffer_size: opts.udp_buffer_size,
                        ttl: opts.udp_conn_ttl,
                        keepalive: true,
                    },
                );
                Ok(Box::new(UdpListenerAdapter::new(listener)))
            }
            _ => Err(ChainError::Unsupported("network")),
        }
    }
}

/// `":port"` listens on all IPv4 interfaces.
pub fn normalize_bind_addr(address: &str) -> String {
    match split_host_port(address) {
        Ok(("", port)) => format!("0.0.0.0:{port}"),
        _ => address.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn empty_host_binds_all_interfaces() {
        assert_eq!(normalize_bind_addr(":9000"), "0.0.0.0:9000");
        assert_eq!(normalize_bind_addr("127.0.0.1:9000"), "127.0.0.1:9000");
    }

    #[tokio::test]
    async fn udp_dial_and_bind() {
        let listener = DEFAULT_ROUTE
            .bind(Network::Udp, "127.0.0.1:0", &BindOptions::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = DEFAULT_ROUTE.dial(Network::Udp, &addr.to_string()).await.unwrap();
        client.write_all(b"ping").await.unwrap();

        let mut peer = listener.accept().await.unwrap();
        assert_eq!(peer.peer_addr(), client.local_addr());
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        listener.close();
    }

    #[tokio::test]
    async fn unsupported_network() {
        assert!(matches!(
            DEFAULT_ROUTE.dial(Network::Unix, "/tmp/x").await,
            Err(ChainError::Unsupported(_))
        ));
    }
}
