//! Datagram pump between two packet endpoints.

use std::io;
use std::sync::Arc;

use netx_core::bypass::Bypass;
use netx_core::{DEFAULT_UDP_BUFFER_SIZE, Network, PacketConn};
use tracing::{debug, trace};

/// Relays datagrams between `pc1` and `pc2` until one side fails.
///
/// Each direction forwards to the address the datagram names: on `pc1`
/// (the tunnel side) that is the destination carried in the frame, on
/// `pc2` replies go back to the source `pc2` reported. Datagrams whose
/// source is matched by the bypass are dropped.
pub struct UdpRelay {
    pc1: Arc<dyn PacketConn>,
    pc2: Arc<dyn PacketConn>,
    bypass: Option<Arc<dyn Bypass>>,
    buffer_size: usize,
}

impl UdpRelay {
    pub fn new(pc1: Arc<dyn PacketConn>, pc2: Arc<dyn PacketConn>) -> Self {
        Self {
            pc1,
            pc2,
            bypass: None,
            buffer_size: DEFAULT_UDP_BUFFER_SIZE,
        }
    }

    pub fn with_bypass(mut self, bypass: Option<Arc<dyn Bypass>>) -> Self {
        self.bypass = bypass;
        self
    }

    pub fn with_buffer_size(mut self, n: usize) -> Self {
        if n > 0 {
            self.buffer_size = n;
        }
        self
    }

    /// Runs both directions; returns the first error.
    pub async fn run(&self) -> io::Result<()> {
        tokio::select! {
            r = self.pump(&self.pc1, &self.pc2, "pc1->pc2") => r,
            r = self.pump(&self.pc2, &self.pc1, "pc2->pc1") => r,
        }
    }

    async fn pump(
        &self,
        src: &Arc<dyn PacketConn>,
        dst: &Arc<dyn PacketConn>,
        dir: &'static str,
    ) -> io::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (n, addr) = src.recv_from(&mut buf).await?;
            if let Some(bypass) = &self.bypass
                && bypass.contains(Network::Udp, &addr.to_string())
            {
                debug!(dir, addr = %addr, "bypass");
                continue;
            }
            dst.send_to(&buf[..n], addr).await?;
            trace!(dir, addr = %addr, bytes = n, "datagram");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netx_core::bypass::AddrBypass;
    use netx_core::io::UdpTunConn;
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;

    async fn udp_endpoint() -> (Arc<dyn PacketConn>, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (Arc::new(socket), addr)
    }

    #[tokio::test]
    async fn relays_both_directions() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let tunnel: Arc<dyn PacketConn> = Arc::new(UdpTunConn::new(a, None));
        let client = UdpTunConn::new(b, None);
        let (pc, _) = udp_endpoint().await;

        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let relay = UdpRelay::new(tunnel, pc);
        tokio::spawn(async move { relay.run().await });

        client.send_to(b"hello", echo_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, echo_addr);
    }

    #[tokio::test]
    async fn bypassed_sources_are_dropped() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let tunnel: Arc<dyn PacketConn> = Arc::new(UdpTunConn::new(a, None));
        let client = UdpTunConn::new(b, None);
        let (pc, pc_addr) = udp_endpoint().await;

        let blocked = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let blocked_addr = blocked.local_addr().unwrap();

        let bypass: Arc<dyn Bypass> = Arc::new(AddrBypass::new(["127.0.0.1"]));
        let relay = UdpRelay::new(pc, tunnel).with_bypass(Some(bypass));
        tokio::spawn(async move { relay.run().await });

        blocked.send_to(b"blocked", pc_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let res = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            client.recv_from(&mut buf),
        )
        .await;
        assert!(res.is_err(), "datagram from {blocked_addr} should be dropped");
    }

    #[tokio::test]
    async fn first_error_ends_relay() {
        let (a, b) = tokio::io::duplex(1024);
        let tunnel: Arc<dyn PacketConn> = Arc::new(UdpTunConn::new(a, None));
        let (pc, _) = udp_endpoint().await;
        drop(b);
        let relay = UdpRelay::new(tunnel, pc);
        assert!(relay.run().await.is_err());
    }
}
