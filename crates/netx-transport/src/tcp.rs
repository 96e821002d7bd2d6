//! Plain TCP dialer.

use std::time::Duration;

use async_trait::async_trait;
use netx_chain::{ChainError, Dialer};
use netx_core::{Conn, DEFAULT_TCP_NO_DELAY};
use tokio::net::TcpStream;

/// Connects directly to an already resolved `host:port`.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    nodelay: bool,
    timeout: Option<Duration>,
}

impl TcpDialer {
    pub fn new() -> Self {
        Self {
            nodelay: DEFAULT_TCP_NO_DELAY,
            timeout: None,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Zero means no timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared by the TCP and TLS dialers.
pub(crate) async fn connect_tcp(
    addr: &str,
    nodelay: bool,
    timeout: Option<Duration>,
) -> Result<Conn, ChainError> {
    let connect = TcpStream::connect(addr);
    let tcp = match timeout {
        Some(t) => tokio::time::timeout(t, connect)
            .await
            .map_err(|_| ChainError::Timeout(t))?,
        None => connect.await,
    }
    .map_err(|e| ChainError::dial(addr, e))?;
    if nodelay {
        tcp.set_nodelay(true)?;
    }
    Ok(Conn::from_tcp(tcp))
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<Conn, ChainError> {
        connect_tcp(addr, self.nodelay, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dials_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = TcpDialer::new()
            .with_timeout(Duration::from_secs(1))
            .dial(&addr.to_string())
            .await
            .unwrap();
        assert_eq!(conn.peer_addr(), Some(addr));
    }

    #[tokio::test]
    async fn refused_is_a_dial_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = TcpDialer::new().dial(&addr.to_string()).await.unwrap_err();
        assert!(matches!(err, ChainError::Dial { .. }));
    }
}
