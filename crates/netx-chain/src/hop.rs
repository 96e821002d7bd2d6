//! A named, reloadable set of nodes plus the selector that picks among them.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use netx_core::bypass::Bypass;
use netx_core::{Network, RequestCtx};
use netx_selector::{DefaultSelector, Selector};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ChainError;
use crate::loader::NodeLoader;
use crate::node::Node;

/// Outcome of [`Hop::select`].
#[derive(Debug, Clone)]
pub enum HopSelection {
    Node(Arc<Node>),
    /// The hop's own bypass matched the target: the route ends before it.
    Bypass,
    /// No live candidate.
    Unavailable,
}

pub struct Hop {
    name: String,
    static_nodes: Vec<Arc<Node>>,
    /// Readers take a snapshot; reloads swap in a new list.
    nodes: ArcSwap<Vec<Arc<Node>>>,
    selector: Arc<dyn Selector<Arc<Node>>>,
    bypass: Option<Arc<dyn Bypass>>,
    loader: Option<Arc<dyn NodeLoader>>,
    reload_period: Duration,
}

impl Hop {
    pub fn new(name: impl Into<String>, nodes: Vec<Arc<Node>>) -> Self {
        Self {
            name: name.into(),
            nodes: ArcSwap::from_pointee(nodes.clone()),
            static_nodes: nodes,
            selector: Arc::new(DefaultSelector::default()),
            bypass: None,
            loader: None,
            reload_period: Duration::ZERO,
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn Selector<Arc<Node>>>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_bypass(mut self, bypass: Arc<dyn Bypass>) -> Self {
        self.bypass = Some(bypass);
        self
    }

    /// Nodes from `loader` are appended to the static ones on every reload.
    /// A zero `period` loads once.
    pub fn with_loader(mut self, loader: Arc<dyn NodeLoader>, period: Duration) -> Self {
        self.loader = Some(loader);
        self.reload_period = period;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        self.nodes.load_full()
    }

    pub fn node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.load().iter().find(|n| n.name == name).cloned()
    }

    /// Pick a node for a request to `address`.
    pub fn select(&self, ctx: &RequestCtx, network: Network, address: &str) -> HopSelection {
        if let Some(bypass) = &self.bypass
            && bypass.contains(network, address)
        {
            debug!(hop = %self.name, dst = %address, "bypass");
            return HopSelection::Bypass;
        }

        let snapshot = self.nodes.load();
        let candidates: Vec<Arc<Node>> = snapshot
            .iter()
            .filter(|n| n.bypass().is_none_or(|b| !b.contains(network, address)))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return HopSelection::Unavailable;
        }
        match self.selector.select(ctx, &candidates) {
            Some(node) => HopSelection::Node(node),
            None => HopSelection::Unavailable,
        }
    }

    /// Reload from the loader. On failure the current node list stays.
    pub async fn reload(&self) -> Result<usize, ChainError> {
        let Some(loader) = &self.loader else {
            return Ok(self.nodes.load().len());
        };
        let loaded = loader.load().await?;
        let mut nodes = self.static_nodes.clone();
        nodes.extend(loaded);
        let n = nodes.len();
        self.nodes.store(Arc::new(nodes));
        Ok(n)
    }

    /// Load now and then every reload period until `shutdown`.
    pub fn spawn_reload(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        self.loader.as_ref()?;
        let hop = self.clone();
        Some(tokio::spawn(async move {
            loop {
                match hop.reload().await {
                    Ok(n) => info!(hop = %hop.name, nodes = n, "hop reloaded"),
                    Err(e) => warn!(hop = %hop.name, error = %e, "hop reload failed, keeping previous nodes"),
                }
                if hop.reload_period.is_zero() {
                    return;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(hop.reload_period) => {}
                }
            }
        }))
    }
}

impl std::fmt::Debug for Hop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hop")
            .field("name", &self.name)
            .field("nodes", &self.nodes.load().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::node;
    use async_trait::async_trait;
    use netx_core::bypass::AddrBypass;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ToggleLoader {
        fail: AtomicBool,
    }

    #[async_trait]
    impl NodeLoader for ToggleLoader {
        async fn load(&self) -> Result<Vec<Arc<Node>>, ChainError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(ChainError::Load("unreachable".into()));
            }
            Ok(vec![Arc::new(node("dyn", "10.0.0.9:1"))])
        }
    }

    fn name_of(sel: HopSelection) -> String {
        match sel {
            HopSelection::Node(n) => n.name.clone(),
            other => format!("{other:?}"),
        }
    }

    #[test]
    fn hop_bypass_truncates() {
        let hop = Hop::new("h", vec![Arc::new(node("a", "1.1.1.1:1"))])
            .with_bypass(Arc::new(AddrBypass::new(["*.internal"])));
        let ctx = RequestCtx::new();
        assert!(matches!(
            hop.select(&ctx, Network::Tcp, "svc.internal:80"),
            HopSelection::Bypass
        ));
        assert_eq!(name_of(hop.select(&ctx, Network::Tcp, "example.com:80")), "a");
    }

    #[test]
    fn node_bypass_drops_only_that_node() {
        let blocked = node("blocked", "1.1.1.1:1").with_bypass(Arc::new(AddrBypass::new(["example.com"])));
        let hop = Hop::new("h", vec![Arc::new(blocked), Arc::new(node("open", "2.2.2.2:1"))]);
        let ctx = RequestCtx::new();
        for _ in 0..4 {
            assert_eq!(name_of(hop.select(&ctx, Network::Tcp, "example.com:443")), "open");
        }

        let only = Hop::new(
            "h",
            vec![Arc::new(node("x", "1.1.1.1:1").with_bypass(Arc::new(AddrBypass::new(["example.com"]))))],
        );
        assert!(matches!(
            only.select(&ctx, Network::Tcp, "example.com:443"),
            HopSelection::Unavailable
        ));
        assert!(matches!(
            Hop::new("empty", vec![]).select(&ctx, Network::Tcp, "x:1"),
            HopSelection::Unavailable
        ));
    }

    #[tokio::test]
    async fn reload_merges_and_keeps_previous_on_failure() {
        let loader = Arc::new(ToggleLoader { fail: AtomicBool::new(false) });
        let hop = Hop::new("h", vec![Arc::new(node("static", "1.1.1.1:1"))])
            .with_loader(loader.clone(), Duration::ZERO);

        assert_eq!(hop.reload().await.unwrap(), 2);
        assert!(hop.node("dyn").is_some());

        loader.fail.store(true, Ordering::SeqCst);
        assert!(hop.reload().await.is_err());
        assert_eq!(hop.nodes().len(), 2);
        assert!(hop.node("static").is_some());
    }

    #[tokio::test]
    async fn spawn_reload_runs_once_without_period() {
        let loader = Arc::new(ToggleLoader { fail: AtomicBool::new(false) });
        let hop = Arc::new(Hop::new("h", vec![]).with_loader(loader, Duration::ZERO));
        let handle = hop.spawn_reload(CancellationToken::new()).unwrap();
        handle.await.unwrap();
        assert_eq!(hop.nodes().len(), 1);
        assert!(Arc::new(Hop::new("static", vec![])).spawn_reload(CancellationToken::new()).is_none());
    }
}
