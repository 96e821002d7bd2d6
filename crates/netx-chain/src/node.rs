//! One hop endpoint.

use std::sync::Arc;

use netx_core::Metadata;
use netx_core::bypass::Bypass;
use netx_core::resolver::{HostMapper, Resolver};
use netx_selector::{Marker, Selectable};

use crate::transport::Transport;

/// A node of a hop. Immutable once built except for its health marker.
pub struct Node {
    pub name: String,
    pub addr: String,
    transport: Transport,
    bypass: Option<Arc<dyn Bypass>>,
    resolver: Option<Arc<dyn Resolver>>,
    host_mapper: Option<Arc<dyn HostMapper>>,
    metadata: Metadata,
    marker: Marker,
}

impl Node {
    pub fn new(name: impl Into<String>, addr: impl Into<String>, transport: Transport) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            transport,
            bypass: None,
            resolver: None,
            host_mapper: None,
            metadata: Metadata::default(),
            marker: Marker::new(),
        }
    }

    pub fn with_bypass(mut self, bypass: Arc<dyn Bypass>) -> Self {
        self.bypass = Some(bypass);
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

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn bypass(&self) -> Option<&Arc<dyn Bypass>> {
        self.bypass.as_ref()
    }

    pub fn resolver(&self) -> Option<&Arc<dyn Resolver>> {
        self.resolver.as_ref()
    }

    pub fn host_mapper(&self) -> Option<&Arc<dyn HostMapper>> {
        self.host_mapper.as_ref()
    }
}

impl Selectable for Node {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn marker(&self) -> Option<&Marker> {
        Some(&self.marker)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("addr", &self.addr)
            .field("fails", &self.marker.count())
            .finish_non_exhaustive()
    }
}
