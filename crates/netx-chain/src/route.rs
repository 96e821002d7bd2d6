//! A materialized path: one node per hop, established leg by leg.

use std::sync::Arc;
use std::time::Instant;

use netx_core::{Conn, Network};
use netx_selector::Marker;
use tracing::debug;

use crate::direct::DEFAULT_ROUTE;
use crate::error::ChainError;
use crate::node::Node;
use crate::resolve::resolve;
use crate::transport::{BindOptions, Listener};

/// The chain a route was built from, for failure attribution.
#[derive(Debug, Clone)]
pub struct RouteOwner {
    pub chain: String,
    pub marker: Option<Arc<Marker>>,
}

/// Built fresh for each connection attempt.
#[derive(Debug, Clone, Default)]
pub struct Route {
    nodes: Vec<Arc<Node>>,
    owner: Option<RouteOwner>,
}

impl Route {
    pub fn new(nodes: Vec<Arc<Node>>, owner: Option<RouteOwner>) -> Self {
        Self { nodes, owner }
    }

    /// A route without nodes: dials go straight to the target.
    pub fn direct() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn chain_name(&self) -> Option<&str> {
        self.owner.as_ref().map(|o| o.chain.as_str())
    }

    /// Reach `address` through every node of the route.
    pub async fn dial(&self, network: Network, address: &str) -> Result<Conn, ChainError> {
        let Some(last) = self.nodes.last() else {
            return DEFAULT_ROUTE.dial(network, address).await;
        };
        let conn = self.connect().await?;
        last.transport().connect(conn, network, address).await
    }

    /// Ask the last node of the route to listen on `address`.
    pub async fn bind(
        &self,
        network: Network,
        address: &str,
        opts: &BindOptions,
    ) -> Result<Box<dyn Listener>, ChainError> {
        let Some(last) = self.nodes.last() else {
            return DEFAULT_ROUTE.bind(network, address, opts).await;
        };
        let conn = self.connect().await?;
        last.transport().bind(conn, network, address, opts).await
    }

    /// Establish the path up to and including the last node's handshake.
    ///
    /// Legs are built strictly in order: node N+1 is reached through the
    /// connection to node N using node N's connector. Each node's marker is
    /// reset on success and marked on failure; the chain marker and error
    /// counter follow the overall outcome.
    pub async fn connect(&self) -> Result<Conn, ChainError> {
        let result = self.connect_nodes().await;
        if let Some(owner) = &self.owner {
            let first = self.nodes.first().map(|n| n.name.as_str()).unwrap_or("");
            match &result {
                Ok(_) => {
                    if let Some(m) = &owner.marker {
                        m.reset();
                    }
                }
                Err(e) => {
                    if let Some(m) = &owner.marker {
                        m.mark();
                    }
                    netx_metrics::record_chain_error(&owner.chain, first);
                    debug!(chain = %owner.chain, node = %first, error = %e, "route failed");
                }
            }
        }
        result
    }

    async fn connect_nodes(&self) -> Result<Conn, ChainError> {
        let Some((first, rest)) = self.nodes.split_first() else {
            return Err(ChainError::NodeUnavailable);
        };

        let start = Instant::now();
        let mut conn = leg(first, async {
            let addr = resolve("ip", &first.addr, first.resolver(), first.host_mapper()).await?;
            let cc = first.transport().dial(&addr).await?;
            first.transport().handshake(cc).await
        })
        .await?;
        if let Some(owner) = &self.owner {
            netx_metrics::record_node_connect_duration(
                &owner.chain,
                &first.name,
                start.elapsed().as_secs_f64(),
            );
        }

        let mut prev = first;
        for node in rest {
            conn = leg(node, async {
                let addr =
                    resolve("ip", &node.addr, node.resolver(), node.host_mapper()).await?;
                let cc = prev.transport().connect(conn, Network::Tcp, &addr).await?;
                node.transport().handshake(cc).await
            })
            .await?;
            prev = node;
        }
        Ok(conn)
    }
}

/// Run one leg and update `node`'s marker from its outcome. A failed leg
/// drops the partially built connection with it.
async fn leg<F>(node: &Node, fut: F) -> Result<Conn, ChainError>
where
    F: std::future::Future<Output = Result<Conn, ChainError>>,
{
    let marker = netx_selector::Selectable::marker(node);
    match fut.await {
        Ok(conn) => {
            if let Some(m) = marker {
                m.reset();
            }
            debug!(node = %node.name, addr = %node.addr, "leg established");
            Ok(conn)
        }
        Err(e) => {
            if let Some(m) = marker {
                m.mark();
            }
            debug!(node = %node.name, addr = %node.addr, error = %e, "leg failed");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, node_with};
    use netx_selector::Selectable;

    #[tokio::test]
    async fn second_hop_failure_marks_only_that_hop() {
        let fake = FakeTransport::default();
        let a = Arc::new(node_with("a", "10.0.0.1:1", fake.transport()));
        let b = Arc::new(node_with("b", "10.0.0.2:1", fake.failing_handshake()));
        a.marker().unwrap().mark();

        let chain_marker = Arc::new(Marker::new());
        let route = Route::new(
            vec![a.clone(), b.clone()],
            Some(RouteOwner {
                chain: "c".into(),
                marker: Some(chain_marker.clone()),
            }),
        );
        let err = route.dial(Network::Tcp, "target:80").await.unwrap_err();
        assert!(matches!(err, ChainError::Handshake(_)));
        assert_eq!(a.marker().unwrap().count(), 0);
        assert_eq!(b.marker().unwrap().count(), 1);
        assert_eq!(chain_marker.count(), 1);

        // b is reached through a's connector, never dialed directly.
        assert_eq!(
            fake.log(),
            ["dial 10.0.0.1:1", "handshake", "connect tcp 10.0.0.2:1", "handshake-fail"]
        );
    }

    #[tokio::test]
    async fn full_route_ends_with_target_connect() {
        let fake = FakeTransport::default();
        let route = Route::new(
            vec![
                Arc::new(node_with("a", "10.0.0.1:1", fake.transport())),
                Arc::new(node_with("b", "10.0.0.2:1", fake.transport())),
            ],
            None,
        );
        route.dial(Network::Udp, "target:53").await.unwrap();
        assert_eq!(
            fake.log(),
            [
                "dial 10.0.0.1:1",
                "handshake",
                "connect tcp 10.0.0.2:1",
                "handshake",
                "connect udp target:53"
            ]
        );
    }

    #[tokio::test]
    async fn first_hop_dial_failure_marks_node() {
        let fake = FakeTransport::default();
        let a = Arc::new(node_with("a", "10.0.0.1:1", fake.failing_dial()));
        let route = Route::new(vec![a.clone()], None);
        assert!(route.connect().await.is_err());
        assert_eq!(a.marker().unwrap().count(), 1);
    }

    #[tokio::test]
    async fn empty_route_dials_directly() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = Route::direct().dial(Network::Tcp, &addr.to_string()).await.unwrap();
        assert_eq!(conn.peer_addr(), Some(addr));
        let (_, peer) = listener.accept().await.unwrap();
        assert_eq!(conn.local_addr(), Some(peer));
    }
}
