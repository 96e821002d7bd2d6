//! In-memory transports for routing tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use netx_core::{Conn, Network};

use crate::error::ChainError;
use crate::node::Node;
use crate::transport::{Connector, Dialer, Transport};

/// Records every dial, handshake and connect into a shared log.
#[derive(Clone, Default)]
pub struct FakeTransport {
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeTransport {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn transport(&self) -> Transport {
        self.build(false, false)
    }

    pub fn failing_dial(&self) -> Transport {
        self.build(true, false)
    }

    pub fn failing_handshake(&self) -> Transport {
        self.build(false, true)
    }

    fn build(&self, fail_dial: bool, fail_handshake: bool) -> Transport {
        let part = Arc::new(FakePart {
            log: self.log.clone(),
            fail_dial,
            fail_handshake,
        });
        Transport::new(part.clone(), part)
    }
}

struct FakePart {
    log: Arc<Mutex<Vec<String>>>,
    fail_dial: bool,
    fail_handshake: bool,
}

impl FakePart {
    fn push(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }
}

fn pipe() -> Conn {
    Conn::new(tokio::io::duplex(64).0)
}

#[async_trait]
impl Dialer for FakePart {
    async fn dial(&self, addr: &str) -> Result<Conn, ChainError> {
        self.push(format!("dial {addr}"));
        if self.fail_dial {
            return Err(ChainError::dial(
                addr,
                std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            ));
        }
        Ok(pipe())
    }

    async fn handshake(&self, conn: Conn) -> Result<Conn, ChainError> {
        if self.fail_handshake {
            self.push("handshake-fail".into());
            return Err(ChainError::Handshake("rejected".into()));
        }
        self.push("handshake".into());
        Ok(conn)
    }
}

#[async_trait]
impl Connector for FakePart {
    async fn connect(
        &self,
        conn: Conn,
        network: Network,
        address: &str,
    ) -> Result<Conn, ChainError> {
        self.push(format!("connect {network} {address}"));
        Ok(conn)
    }
}

pub fn node_with(name: &str, addr: &str, transport: Transport) -> Node {
    Node::new(name, addr, transport)
}

pub fn node(name: &str, addr: &str) -> Node {
    node_with(name, addr, FakeTransport::default().transport())
}
