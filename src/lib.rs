//! # netx
//!
//! Chain routing and relay tunnelling.
//!
//! Services accept connections and hand them to handlers; handlers reach
//! their targets through a router that picks a chain, one node per hop, and
//! dials the route hop by hop.
//!
//! ## Crates
//!
//! - [`netx_core`] - Shared defaults, request context and policy contracts
//! - [`netx_selector`] - Node selection strategies, filters and failure markers
//! - [`netx_proto`] - Relay wire codec
//! - [`netx_dns`] - DNS resolver and static hosts
//! - [`netx_chain`] - Nodes, hops, chains and the router
//! - [`netx_transport`] - TCP/TLS dialers and acceptors
//! - [`netx_relay`] - Relay and tunnel handlers and connectors
//! - [`netx_config`] - Configuration loading and validation
//! - [`netx_metrics`] - Prometheus-compatible metrics
//! - [`netx_server`] - Registry, builder, service runtime and CLI

pub use netx_chain as chain;
pub use netx_config as config;
pub use netx_core as core;
pub use netx_dns as dns;
pub use netx_metrics as metrics;
pub use netx_proto as proto;
pub use netx_relay as relay;
pub use netx_selector as selector;
pub use netx_server as server;
pub use netx_transport as transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use netx_chain::{Chain, ChainError, Chainer, Hop, Node, Router};
    pub use netx_config::{Config, load_config, validate_config};
    pub use netx_core::{Conn, Metadata, Network, RequestCtx};
    pub use netx_relay::Handler;
    pub use netx_server::{CancellationToken, Registry, Server, ServerError, run_with_shutdown};
}
