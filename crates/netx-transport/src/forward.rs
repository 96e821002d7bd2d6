//! Forward connector: the node itself is the destination.

use async_trait::async_trait;
use netx_chain::{ChainError, Connector};
use netx_core::{Conn, Network};
use tracing::trace;

/// Hands the connection to the node back unchanged. Used for nodes that
/// terminate the chain at their own address (port forwarding targets).
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardConnector;

#[async_trait]
impl Connector for ForwardConnector {
    async fn connect(
        &self,
        conn: Conn,
        network: Network,
        address: &str,
    ) -> Result<Conn, ChainError> {
        trace!(network = %network, dst = %address, "forward");
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn returns_same_stream() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut conn = ForwardConnector
            .connect(Conn::new(a), Network::Tcp, "ignored:1")
            .await
            .unwrap();
        conn.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn bind_is_unsupported() {
        let (a, _b) = tokio::io::duplex(64);
        let res = ForwardConnector
            .bind(Conn::new(a), Network::Tcp, ":0", &Default::default())
            .await;
        assert!(matches!(res, Err(ChainError::Unsupported(_))));
    }
}
