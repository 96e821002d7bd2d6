//! Chain routing for netx.
//!
//! A [`Chain`] is an ordered list of [`Hop`]s; each hop holds [`Node`]s and
//! a selector. For every request the chain picks one node per hop and
//! returns a [`Route`], which then establishes the path leg by leg: dial the
//! first node, tunnel to each following node through the previous node's
//! connector, and finally ask the last node to connect to (or bind) the
//! target. The [`Router`] wraps that with target resolution, retries and a
//! per-attempt timeout, and falls back to a direct dial when no chain is set.

pub mod chain;
pub mod direct;
pub mod error;
pub mod hop;
pub mod listener;
pub mod loader;
pub mod node;
pub mod resolve;
pub mod route;
pub mod router;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use chain::{Chain, ChainGroup, Chainer};
pub use direct::{DEFAULT_ROUTE, DirectRoute};
pub use error::ChainError;
pub use hop::{Hop, HopSelection};
pub use listener::{TcpListenerAdapter, UdpListenerAdapter};
pub use loader::{FileSource, HttpSource, NodeDecoder, NodeLoader, Source, SourceLoader};
pub use node::Node;
pub use route::{Route, RouteOwner};
pub use router::Router;
pub use transport::{BindOptions, Connector, Dialer, Listener, Transport};
