//! netx service runtime.
//!
//! Turns a [`netx_config::Config`] into running services: the [`Registry`]
//! maps config `type` strings to factories and holds named policy objects,
//! the builder wires hops, chains, routers and handlers together, and each
//! [`Service`] runs its own accept loop until shutdown.

pub mod cli;
mod builder;
mod error;
mod factory;
mod registry;
mod server;
mod service;
mod util;

pub use error::ServerError;
pub use registry::{
    ConnectorFactory, DialerFactory, HandlerArgs, HandlerFactory, Registry, Table,
};
pub use server::{BoundServer, Server, run_with_shutdown};
pub use service::{BoundService, Service, ServiceListener};
pub use tokio_util::sync::CancellationToken;
pub use util::{ConnectionGuard, ConnectionTracker, create_listener, listen_addr};
