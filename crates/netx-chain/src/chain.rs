//! Chains of hops and groups of chains.

use std::sync::Arc;

use netx_core::{Metadata, Network, RequestCtx};
use netx_selector::{DefaultSelector, Marker, Selectable, Selector};

use crate::error::ChainError;
use crate::hop::{Hop, HopSelection};
use crate::route::{Route, RouteOwner};

/// Anything that can materialize a route.
pub trait Chainer: Selectable {
    fn name(&self) -> &str;

    /// Choose one node per hop for a request to `address`. An empty route
    /// means "dial directly".
    fn route(&self, ctx: &RequestCtx, network: Network, address: &str)
    -> Result<Route, ChainError>;
}

/// An ordered list of hops.
pub struct Chain {
    name: String,
    hops: Vec<Arc<Hop>>,
    metadata: Metadata,
    marker: Arc<Marker>,
}

impl Chain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hops: Vec::new(),
            metadata: Metadata::default(),
            marker: Arc::new(Marker::new()),
        }
    }

    pub fn with_hop(mut self, hop: Arc<Hop>) -> Self {
        self.hops.push(hop);
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn hops(&self) -> &[Arc<Hop>] {
        &self.hops
    }
}

impl Selectable for Chain {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn marker(&self) -> Option<&Marker> {
        Some(&self.marker)
    }
}

impl Chainer for Chain {
    fn name(&self) -> &str {
        &self.name
    }

    fn route(
        &self,
        ctx: &RequestCtx,
        network: Network,
        address: &str,
    ) -> Result<Route, ChainError> {
        let mut nodes = Vec::with_capacity(self.hops.len());
        for hop in &self.hops {
            match hop.select(ctx, network, address) {
                HopSelection::Node(node) => nodes.push(node),
                HopSelection::Bypass => break,
                HopSelection::Unavailable => return Err(ChainError::NodeUnavailable),
            }
        }
        Ok(Route::new(
            nodes,
            Some(RouteOwner {
                chain: self.name.clone(),
                marker: Some(self.marker.clone()),
            }),
        ))
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("name", &self.name)
            .field("hops", &self.hops.len())
            .finish_non_exhaustive()
    }
}

/// Several chains behind a selector. Chain markers feed the selector's
/// fail filter, so a chain that keeps failing drops out of rotation.
pub struct ChainGroup {
    name: String,
    chains: Vec<Arc<dyn Chainer>>,
    selector: Arc<dyn Selector<Arc<dyn Chainer>>>,
    metadata: Metadata,
}

impl ChainGroup {
    pub fn new(name: impl Into<String>, chains: Vec<Arc<dyn Chainer>>) -> Self {
        Self {
            name: name.into(),
            chains,
            selector: Arc::new(DefaultSelector::default()),
            metadata: Metadata::default(),
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn Selector<Arc<dyn Chainer>>>) -> Self {
        self.selector = selector;
        self
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

impl Selectable for ChainGroup {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl Chainer for ChainGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn route(
        &self,
        ctx: &RequestCtx,
        network: Network,
        address: &str,
    ) -> Result<Route, ChainError> {
        let chain = match self.chains.as_slice() {
            [] => return Ok(Route::direct()),
            [only] => only.clone(),
            all => self
                .selector
                .select(ctx, all)
                .ok_or(ChainError::NodeUnavailable)?,
        };
        chain.route(ctx, network, address)
    }
}
