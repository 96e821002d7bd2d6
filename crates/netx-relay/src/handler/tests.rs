use std::net::SocketAddr;
use std::sync::Arc;

use netx_chain::{BindOptions, Connector, Hop, Listener, Node, Router};
use netx_core::auth::MemoryAuther;
use netx_core::bypass::AddrBypass;
use netx_core::io::UdpTunConn;
use netx_core::limiter::KeyedRateLimiter;
use netx_core::{Conn, Network, PacketConn, RequestCtx};
use netx_proto::{
    Address, CMD_BIND, CMD_CONNECT, FLAG_UDP, Feature, Features as _, Request, Status,
    read_response, write_request,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;

use super::*;
use crate::connector::{ConnectorOptions, RelayConnector};
use crate::testing::{echo_server, unused_transport};

fn handler(opts: RelayOptions) -> RelayHandler {
    RelayHandler::new("relay-test", Arc::new(Router::new()), opts)
}

/// Run `h` on the server end of an in-memory pipe.
fn serve(h: Arc<RelayHandler>) -> (Conn, JoinHandle<Result<(), RelayError>>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(async move { h.handle(Conn::new(server), RequestCtx::new()).await });
    (Conn::new(client), task)
}

fn connect_req(addr: &str) -> Request {
    Request::new(CMD_CONNECT).with(Feature::Addr(Address::parse(addr).unwrap()))
}

async fn roundtrip(conn: &mut Conn, payload: &[u8]) -> Vec<u8> {
    conn.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    conn.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn connect_relays_to_target() {
    let echo = echo_server().await;
    for nodelay in [true, false] {
        let opts = RelayOptions {
            nodelay,
            ..Default::default()
        };
        let (mut client, task) = serve(Arc::new(handler(opts)));
        write_request(&mut client, &connect_req(&echo.to_string())).await.unwrap();
        client.write_all(b"hello").await.unwrap();

        let resp = read_response(&mut client).await.unwrap();
        assert_eq!(resp.status, Status::Ok);
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(client);
        let _ = task.await.unwrap();
    }
}

#[tokio::test]
async fn relay_connector_round_trip() {
    let echo = echo_server().await;
    let (client, task) = serve(Arc::new(handler(RelayOptions::default())));
    let mut conn = RelayConnector::new(ConnectorOptions::default())
        .connect(client, Network::Tcp, &echo.to_string())
        .await
        .unwrap();
    assert_eq!(roundtrip(&mut conn, b"through the relay").await, b"through the relay");
    drop(conn);
    let _ = task.await.unwrap();
}

#[tokio::test]
async fn bad_version_gets_bad_request() {
    let (mut client, task) = serve(Arc::new(handler(RelayOptions::default())));
    client.write_all(&[0x05, CMD_CONNECT, 0, 0]).await.unwrap();
    let resp = read_response(&mut client).await.unwrap();
    assert_eq!(resp.status, Status::BadRequest);
    assert!(matches!(task.await.unwrap(), Err(RelayError::BadVersion(5))));
}

#[tokio::test]
async fn wrong_password_is_unauthorized() {
    let h = handler(RelayOptions::default())
        .with_auther(Arc::new(MemoryAuther::from_pairs([("alice", "secret")])));
    let (mut client, task) = serve(Arc::new(h));
    let req = connect_req("127.0.0.1:9").with(Feature::UserAuth {
        username: "alice".into(),
        password: "wrong".into(),
    });
    write_request(&mut client, &req).await.unwrap();
    let resp = read_response(&mut client).await.unwrap();
    assert_eq!(resp.status, Status::Unauthorized);
    assert!(matches!(task.await.unwrap(), Err(RelayError::Unauthorized)));
}

#[tokio::test]
async fn unknown_command_is_rejected() {
    let (mut client, task) = serve(Arc::new(handler(RelayOptions::default())));
    let req = Request::new(0x03).with(Feature::Addr(Address::parse("127.0.0.1:9").unwrap()));
    write_request(&mut client, &req).await.unwrap();
    let resp = read_response(&mut client).await.unwrap();
    assert_eq!(resp.status, Status::BadRequest);
    assert!(matches!(task.await.unwrap(), Err(RelayError::UnknownCommand(3))));
}

#[tokio::test]
async fn bypassed_target_is_forbidden() {
    let h = handler(RelayOptions::default()).with_bypass(Arc::new(AddrBypass::new(["127.0.0.1"])));
    let (mut client, task) = serve(Arc::new(h));
    write_request(&mut client, &connect_req("127.0.0.1:9")).await.unwrap();
    let resp = read_response(&mut client).await.unwrap();
    assert_eq!(resp.status, Status::Forbidden);
    assert!(matches!(task.await.unwrap(), Err(RelayError::Forbidden(_))));
}

#[tokio::test]
async fn unreachable_target_reports_host_unreachable() {
    // Bind then drop to get a port nobody listens on.
    let port = {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        ln.local_addr().unwrap().port()
    };
    let (mut client, task) = serve(Arc::new(handler(RelayOptions::default())));
    write_request(&mut client, &connect_req(&format!("127.0.0.1:{port}"))).await.unwrap();
    let resp = read_response(&mut client).await.unwrap();
    assert_eq!(resp.status, Status::HostUnreachable);
    assert!(task.await.unwrap().is_err());
}

#[tokio::test]
async fn bind_disabled_is_forbidden() {
    let (mut client, task) = serve(Arc::new(handler(RelayOptions::default())));
    let req = Request::new(CMD_BIND).with(Feature::Addr(Address::parse("127.0.0.1:0").unwrap()));
    write_request(&mut client, &req).await.unwrap();
    let resp = read_response(&mut client).await.unwrap();
    assert_eq!(resp.status, Status::Forbidden);
    assert!(matches!(task.await.unwrap(), Err(RelayError::Forbidden(_))));
}

#[tokio::test]
async fn tcp_bind_hands_peers_to_client() {
    let opts = RelayOptions {
        enable_bind: true,
        ..Default::default()
    };
    let (client, _task) = serve(Arc::new(handler(opts)));
    let ln = RelayConnector::new(ConnectorOptions::default())
        .bind(client, Network::Tcp, "127.0.0.1:0", &BindOptions::default())
        .await
        .unwrap();
    let bound = ln.local_addr().unwrap();
    assert_ne!(bound.port(), 0);

    let mut peer = TcpStream::connect(bound).await.unwrap();
    peer.write_all(b"ping").await.unwrap();

    let mut conn = ln.accept().await.unwrap();
    assert_eq!(conn.peer_addr(), Some(peer.local_addr().unwrap()));
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    conn.write_all(b"pong").await.unwrap();
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
    ln.close();
}

#[tokio::test]
async fn udp_bind_frames_datagrams() {
    let opts = RelayOptions {
        enable_bind: true,
        ..Default::default()
    };
    let (mut client, task) = serve(Arc::new(handler(opts)));
    let req = Request::new(CMD_BIND | FLAG_UDP)
        .with(Feature::Addr(Address::parse("127.0.0.1:0").unwrap()));
    write_request(&mut client, &req).await.unwrap();
    let resp = read_response(&mut client).await.unwrap();
    assert_eq!(resp.status, Status::Ok);
    let bound: SocketAddr = resp.addrs()[0].to_string().parse().unwrap();
    assert_ne!(bound.port(), 0);

    let tun = UdpTunConn::new(client, None);
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    // client -> peer: the frame address is the destination
    tun.send_to(b"to peer", peer_addr).await.unwrap();
    let mut buf = [0u8; 64];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"to peer");
    assert_eq!(from, bound);

    // peer -> client: the frame address is the source
    peer.send_to(b"to client", bound).await.unwrap();
    let (n, src) = tokio::time::timeout(Duration::from_secs(5), tun.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"to client");
    assert_eq!(src, peer_addr);

    drop(tun);
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn udp_bind_through_connector_accepts_peers() {
    let opts = RelayOptions {
        enable_bind: true,
        ..Default::default()
    };
    let (client, _task) = serve(Arc::new(handler(opts)));
    let ln = RelayConnector::new(ConnectorOptions::default())
        .bind(client, Network::Udp, "127.0.0.1:0", &BindOptions::default())
        .await
        .unwrap();
    let bound = ln.local_addr().unwrap();
    assert_ne!(bound.port(), 0);

    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    a.send_to(b"from a", bound).await.unwrap();

    let mut conn_a = tokio::time::timeout(Duration::from_secs(5), ln.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn_a.peer_addr(), Some(a.local_addr().unwrap()));
    let mut buf = [0u8; 64];
    let n = conn_a.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"from a");

    // a second source is a second connection
    b.send_to(b"from b", bound).await.unwrap();
    let mut conn_b = tokio::time::timeout(Duration::from_secs(5), ln.accept())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conn_b.peer_addr(), Some(b.local_addr().unwrap()));
    let n = conn_b.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"from b");

    // replies go back to the right peer, one datagram per write
    conn_a.write_all(b"echo a").await.unwrap();
    conn_b.write_all(b"echo b").await.unwrap();
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), a.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!((&buf[..n], from), (&b"echo a"[..], bound));
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), b.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!((&buf[..n], from), (&b"echo b"[..], bound));

    ln.close();
}

#[tokio::test]
async fn forward_ignores_requested_target() {
    let echo = echo_server().await;
    let node = Arc::new(Node::new("echo", echo.to_string(), unused_transport()));
    let h = handler(RelayOptions::default()).with_hop(Arc::new(Hop::new("fwd", vec![node])));
    let (mut client, task) = serve(Arc::new(h));

    write_request(&mut client, &connect_req("192.0.2.1:80")).await.unwrap();
    client.write_all(b"fwd").await.unwrap();
    let resp = read_response(&mut client).await.unwrap();
    assert_eq!(resp.status, Status::Ok);
    let mut buf = [0u8; 3];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"fwd");
    drop(client);
    let _ = task.await.unwrap();
}

#[tokio::test]
async fn forward_without_nodes_is_unavailable() {
    let h = handler(RelayOptions::default()).with_hop(Arc::new(Hop::new("empty", Vec::new())));
    let (mut client, task) = serve(Arc::new(h));
    write_request(&mut client, &connect_req("192.0.2.1:80")).await.unwrap();
    let resp = read_response(&mut client).await.unwrap();
    assert_eq!(resp.status, Status::ServiceUnavailable);
    assert!(task.await.unwrap().is_err());
}

#[tokio::test]
async fn rate_limited_connections_are_dropped() {
    let h = Arc::new(
        handler(RelayOptions::default()).with_rate_limiter(Arc::new(KeyedRateLimiter::new(1, 1))),
    );
    let echo = echo_server().await;
    let ctx = RequestCtx::new().with_client_addr("10.1.2.3:5000");

    let (client, server) = tokio::io::duplex(4096);
    let first = tokio::spawn({
        let h = h.clone();
        let ctx = ctx.clone();
        async move { h.handle(Conn::new(server), ctx).await }
    });
    let mut client = Conn::new(client);
    write_request(&mut client, &connect_req(&echo.to_string())).await.unwrap();
    // the response is held back until the first payload arrives
    client.write_all(b"ping").await.unwrap();
    assert_eq!(read_response(&mut client).await.unwrap().status, Status::Ok);
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    let (_c2, s2) = tokio::io::duplex(4096);
    let second = h.handle(Conn::new(s2), ctx).await;
    assert!(matches!(second, Err(RelayError::RateLimited)));

    drop(client);
    let _ = first.await.unwrap();
}

#[test]
fn options_from_metadata() {
    let md = netx_core::Metadata::from_pairs([
        ("bind", "true"),
        ("nodelay", "true"),
        ("udpBufferSize", "100"),
        ("readTimeout", "3s"),
        ("hash", "host"),
    ]);
    let opts = RelayOptions::from_metadata(&md);
    assert!(opts.enable_bind);
    assert!(opts.nodelay);
    assert_eq!(opts.udp_buffer_size, 512);
    assert_eq!(opts.read_timeout, Some(Duration::from_secs(3)));
    assert_eq!(opts.hash, "host");
    assert_eq!(opts.observe_period, Duration::from_secs(5));
}
