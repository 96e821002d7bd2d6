//! Entry point for handlers: resolve, route, retry.

use std::sync::Arc;
use std::time::Duration;

use netx_core::resolver::{HostMapper, Resolver};
use netx_core::{Conn, DEFAULT_DIAL_TIMEOUT_SECS, DEFAULT_ROUTER_RETRIES, Network, RequestCtx};
use tracing::{debug, warn};

use crate::chain::Chainer;
use crate::error::ChainError;
use crate::resolve::resolve;
use crate::route::Route;
use crate::transport::{BindOptions, Listener};

#[derive(Clone)]
pub struct Router {
    chain: Option<Arc<dyn Chainer>>,
    retries: usize,
    timeout: Duration,
    resolver: Option<Arc<dyn Resolver>>,
    host_mapper: Option<Arc<dyn HostMapper>>,
}

impl Default for Router {
    fn default() -> Self {
        Self {
            chain: None,
            retries: DEFAULT_ROUTER_RETRIES,
            timeout: Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS),
            resolver: None,
            host_mapper: None,
        }
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(mut self, chain: Arc<dyn Chainer>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Extra attempts after the first failure.
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Per-attempt timeout; zero disables it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_host_mapper(mut self, hosts: Arc<dyn HostMapper>) -> Self {
        self.host_mapper = Some(hosts);
        self
    }

    pub fn chain(&self) -> Option<&Arc<dyn Chainer>> {
        self.chain.as_ref()
    }

    pub async fn dial(
        &self,
        ctx: &RequestCtx,
        network: Network,
        address: &str,
    ) -> Result<Conn, ChainError> {
        let mut last = ChainError::NodeUnavailable;
        for attempt in 0..=self.retries {
            let res = self
                .with_deadline(async {
                    let route = self.route(ctx, network, address)?;
                    let target = resolve(
                        "ip",
                        address,
                        self.resolver.as_ref(),
                        self.host_mapper.as_ref(),
                    )
                    .await?;
                    route.dial(network, &target).await
                })
                .await;
            match res {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(attempt, network = %network, dst = %address, error = %e, "dial attempt failed");
                    last = e;
                }
            }
        }
        warn!(network = %network, dst = %address, error = %last, "dial failed");
        Err(last)
    }

    pub async fn bind(
        &self,
        ctx: &RequestCtx,
        network: Network,
        address: &str,
        opts: &BindOptions,
    ) -> Result<Box<dyn Listener>, ChainError> {
        let mut last = ChainError::NodeUnavailable;
        for attempt in 0..=self.retries {
            let res = self
                .with_deadline(async {
                    let route = self.route(ctx, network, address)?;
                    route.bind(network, address, opts).await
                })
                .await;
            match res {
                Ok(ln) => return Ok(ln),
                Err(e) => {
                    debug!(attempt, network = %network, addr = %address, error = %e, "bind attempt failed");
                    last = e;
                }
            }
        }
        warn!(network = %network, addr = %address, error = %last, "bind failed");
        Err(last)
    }

    fn route(
        &self,
        ctx: &RequestCtx,
        network: Network,
        address: &str,
    ) -> Result<Route, ChainError> {
        match &self.chain {
            Some(chain) => chain.route(ctx, network, address),
            None => Ok(Route::direct()),
        }
    }

    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, ChainError>
    where
        F: std::future::Future<Output = Result<T, ChainError>>,
    {
        if self.timeout.is_zero() {
            return fut.await;
        }
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ChainError::Timeout(self.timeout))?
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("chain", &self.chain.as_ref().map(|c| c.name().to_string()))
            .field("retries", &self.retries)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Chain;
    use crate::hop::Hop;
    use crate::testing::{FakeTransport, node_with};
    use netx_selector::Selectable;

    #[tokio::test]
    async fn no_chain_dials_directly() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = Router::new()
            .dial(&RequestCtx::new(), Network::Tcp, &addr.to_string())
            .await
            .unwrap();
        assert_eq!(conn.peer_addr(), Some(addr));
    }

    #[tokio::test]
    async fn alternates_first_hop_and_reuses_single_second_hop() {
        let fake = FakeTransport::default();
        let chain = Chain::new("c")
            .with_hop(Arc::new(Hop::new(
                "a",
                vec![
                    Arc::new(node_with("a1", "10.0.0.1:1", fake.transport())),
                    Arc::new(node_with("a2", "10.0.0.2:1", fake.transport())),
                ],
            )))
            .with_hop(Arc::new(Hop::new(
                "b",
                vec![Arc::new(node_with("b1", "10.0.0.3:1", fake.transport()))],
            )));
        let router = Router::new().with_chain(Arc::new(chain));
        let ctx = RequestCtx::new();
        for _ in 0..4 {
            router.dial(&ctx, Network::Tcp, "target:80").await.unwrap();
        }

        let dials: Vec<String> = fake
            .log()
            .into_iter()
            .filter(|l| l.starts_with("dial"))
            .collect();
        assert_eq!(dials.len(), 4);
        assert_ne!(dials[0], dials[1]);
        assert_eq!(dials[0], dials[2]);
        assert_eq!(dials[1], dials[3]);
        let via_b = fake.log().iter().filter(|l| *l == "connect tcp 10.0.0.3:1").count();
        assert_eq!(via_b, 4);
    }

    #[tokio::test]
    async fn retries_then_reports_last_error() {
        let fake = FakeTransport::default();
        let node = Arc::new(node_with("bad", "10.0.0.1:1", fake.failing_dial()));
        let chain = Arc::new(Chain::new("c").with_hop(Arc::new(Hop::new("h", vec![node.clone()]))));
        let router = Router::new().with_chain(chain.clone()).with_retries(2);

        let err = router
            .dial(&RequestCtx::new(), Network::Tcp, "target:80")
            .await
            .unwrap_err();
        // a lone node is never filtered out, so every attempt dials it
        assert!(matches!(err, ChainError::Dial { .. }));
        assert_eq!(fake.log(), ["dial 10.0.0.1:1"; 3]);
        assert_eq!(node.marker().unwrap().count(), 3);
        assert_eq!(chain.marker().unwrap().count(), 3);
    }
}
