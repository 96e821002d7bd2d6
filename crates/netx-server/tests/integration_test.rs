//! Integration tests for netx-server.
//!
//! Every test runs real services on loopback sockets:
//! - forwarding through a relay chain (plain and TLS hops)
//! - relay authentication
//! - reverse port forwarding through a published tunnel

use std::net::SocketAddr;
use std::time::Duration;

use netx_chain::Connector as _;
use netx_config::{Config, parse_config};
use netx_core::{Conn, Network};
use netx_proto::TunnelId;
use netx_relay::{ConnectorOptions, TunnelConnector};
use netx_server::{CancellationToken, Registry, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const TID: &str = "1f0e9d8c-7b6a-4594-a3b2-c1d0e9f8a7b6";

// ============================================================================
// Helpers
// ============================================================================

/// Echo server that serves any number of connections.
async fn echo_server() -> SocketAddr {
    let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = ln.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut s, _)) = ln.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = s.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

struct Running {
    addrs: Vec<(String, Option<SocketAddr>)>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), netx_server::ServerError>>,
}

impl Running {
    fn addr(&self, service: &str) -> SocketAddr {
        self.addrs
            .iter()
            .find(|(n, _)| n == service)
            .and_then(|(_, a)| *a)
            .unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(35), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn start(yaml: &str) -> Running {
    let cfg: Config = parse_config(yaml, "yaml").unwrap();
    netx_config::validate_config(&cfg).unwrap();
    let names: Vec<String> = cfg.services.iter().map(|s| s.name.clone()).collect();

    let bound = Server::build(&cfg, Registry::with_defaults())
        .unwrap()
        .bind()
        .await
        .unwrap();
    let addrs = names
        .into_iter()
        .map(|n| {
            let a = bound.local_addr(&n);
            (n, a)
        })
        .collect();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(bound.serve(shutdown.clone()));
    Running {
        addrs,
        shutdown,
        task,
    }
}

async fn roundtrip(addr: SocketAddr, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut c = TcpStream::connect(addr).await?;
    c.write_all(payload).await?;
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), c.read_exact(&mut buf))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out"))??;
    Ok(buf)
}

/// Reach the published tunnel `tid` through its public node.
async fn tunnel_roundtrip(
    public: SocketAddr,
    tid: TunnelId,
    payload: &[u8],
) -> Result<Vec<u8>, String> {
    let tcp = TcpStream::connect(public).await.map_err(|e| e.to_string())?;
    let mut client = TunnelConnector::new(tid, ConnectorOptions::default())
        .connect(Conn::from_tcp(tcp), Network::Tcp, "app.example.com:443")
        .await
        .map_err(|e| e.to_string())?;
    client.write_all(payload).await.map_err(|e| e.to_string())?;
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .map_err(|_| "read timed out".to_string())?
        .map_err(|e| e.to_string())?;
    Ok(buf)
}

/// Relay exit plus a forward entry that reaches `target` through it.
fn entry_config(exit: SocketAddr, target: SocketAddr, dialer: &str, password: &str) -> String {
    format!(
        r#"
services:
  - name: entry
    addr: "127.0.0.1:0"
    handler:
      type: forward
      chain: via-exit
    forwarder:
      nodes: [{{name: target, addr: "{target}"}}]
chains:
  - name: via-exit
    hops:
      - name: exit
        nodes:
          - name: exit-0
            addr: "{exit}"
            connector: {{type: relay, auth: {{username: alice, password: {password}}}}}
            dialer: {{type: {dialer}, tls: {{serverName: localhost}}}}
"#
    )
}

fn exit_config(listener: &str) -> String {
    format!(
        r#"
services:
  - name: exit
    addr: "127.0.0.1:0"
    listener: {{type: {listener}}}
    handler:
      type: relay
      auther: users
authers:
  - name: users
    auths: [{{username: alice, password: s3cret}}]
"#
    )
}

// ============================================================================
// Relay chain
// ============================================================================

#[tokio::test]
async fn forward_through_relay_chain() {
    let target = echo_server().await;
    let exit = start(&exit_config("tcp")).await;
    let entry = start(&entry_config(exit.addr("exit"), target, "tcp", "s3cret")).await;

    let got = roundtrip(entry.addr("entry"), b"through the chain").await.unwrap();
    assert_eq!(got, b"through the chain");

    // a second request picks the same node again
    let got = roundtrip(entry.addr("entry"), b"again").await.unwrap();
    assert_eq!(got, b"again");

    entry.stop().await;
    exit.stop().await;
}

#[tokio::test]
async fn forward_through_tls_hop() {
    let target = echo_server().await;
    let exit = start(&exit_config("tls")).await;
    let entry = start(&entry_config(exit.addr("exit"), target, "tls", "s3cret")).await;

    let got = roundtrip(entry.addr("entry"), b"over tls").await.unwrap();
    assert_eq!(got, b"over tls");

    entry.stop().await;
    exit.stop().await;
}

#[tokio::test]
async fn wrong_credentials_close_the_client() {
    let target = echo_server().await;
    let exit = start(&exit_config("tcp")).await;
    let entry = start(&entry_config(exit.addr("exit"), target, "tcp", "wrong")).await;

    let mut c = TcpStream::connect(entry.addr("entry")).await.unwrap();
    let _ = c.write_all(b"hello").await;
    let mut buf = [0u8; 5];
    let res = tokio::time::timeout(Duration::from_secs(5), c.read(&mut buf))
        .await
        .expect("connection left open");
    assert!(matches!(res, Ok(0) | Err(_)));

    entry.stop().await;
    exit.stop().await;
}

// ============================================================================
// Reverse tunnel
// ============================================================================

#[tokio::test]
async fn reverse_forward_through_tunnel() {
    let target = echo_server().await;

    let public = start(&format!(
        r#"
services:
  - name: tunnel
    addr: "127.0.0.1:0"
    handler:
      type: tunnel
      metadata:
        node: node-a
        tunnel: ["app.example.com:{TID}"]
"#
    ))
    .await;
    let tunnel_addr = public.addr("tunnel");

    let private = start(&format!(
        r#"
services:
  - name: rev
    addr: "127.0.0.1:0"
    handler: {{type: forward}}
    forwarder:
      nodes: [{{name: app, addr: "{target}"}}]
    listener:
      type: rtcp
      chain: publish
chains:
  - name: publish
    hops:
      - name: public
        nodes:
          - name: public-0
            addr: "{tunnel_addr}"
            connector:
              type: tunnel
              metadata: {{tunnel.id: "{TID}"}}
"#
    ))
    .await;

    let tid: TunnelId = TID.parse().unwrap();
    let mut last_err = None;
    for _ in 0..50 {
        match tunnel_roundtrip(tunnel_addr, tid, b"reverse").await {
            Ok(got) => {
                assert_eq!(got, b"reverse");
                last_err = None;
                break;
            }
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    assert!(last_err.is_none(), "tunnel never became reachable: {last_err:?}");

    private.stop().await;
    public.stop().await;
}
