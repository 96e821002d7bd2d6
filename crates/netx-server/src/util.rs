//! Listener setup and connection bookkeeping for service loops.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::error::ServerError;

/// Tracks in-flight connections so shutdown can wait for them.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    active: Arc<AtomicUsize>,
    zero_notify: Arc<Notify>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one connection until the guard drops.
    pub fn guard(&self) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            tracker: self.clone(),
        }
    }

    fn release(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.zero_notify.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// `true` if the count reached zero before `timeout`.
    pub async fn wait_for_zero(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.zero_notify.notified();
            if self.count() == 0 {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return self.count() == 0,
            }
        }
    }
}

pub struct ConnectionGuard {
    tracker: ConnectionTracker,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release();
    }
}

/// Parse a service address. A bare `:port` listens on all IPv4 interfaces.
pub fn listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    if let Some(port) = addr.strip_prefix(':') {
        let port = port
            .parse::<u16>()
            .map_err(|_| ServerError::Build(format!("invalid listen address: {addr}")))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    addr.parse()
        .map_err(|_| ServerError::Build(format!("invalid listen address: {addr}")))
}

/// Create a TCP listener with custom backlog.
pub fn create_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ServerError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    Ok(TcpListener::from_std(std::net::TcpListener::from(socket))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_addresses() {
        assert_eq!(listen_addr(":8420").unwrap(), "0.0.0.0:8420".parse().unwrap());
        assert_eq!(listen_addr("[::1]:80").unwrap(), "[::1]:80".parse().unwrap());
        assert!(listen_addr(":http").is_err());
        assert!(listen_addr("example.com:80").is_err());
    }

    #[tokio::test]
    async fn tracker_drains_when_guards_drop() {
        let tracker = ConnectionTracker::new();
        let a = tracker.guard();
        let b = tracker.guard();
        assert_eq!(tracker.count(), 2);
        assert!(!tracker.wait_for_zero(Duration::from_millis(20)).await);

        drop(a);
        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_for_zero(Duration::from_secs(5)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(b);
        assert!(waiter.await.unwrap());
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn listener_binds_ephemeral_port() {
        let ln = create_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        assert_ne!(ln.local_addr().unwrap().port(), 0);
    }
}
