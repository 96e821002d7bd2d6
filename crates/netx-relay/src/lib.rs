//! Relay and tunnel protocols for netx.
//!
//! Server side: [`RelayHandler`] answers CONNECT, BIND and static forward
//! requests; [`ForwardHandler`] pipes raw connections to a node of a hop;
//! [`TunnelHandler`] keeps a [`ConnectorPool`] of mux sessions published by
//! tunnel clients and dispatches CONNECT requests (and the public HTTP
//! [`Entrypoint`]) onto them, across nodes through service discovery when
//! the session lives elsewhere.
//!
//! Client side: [`RelayConnector`] and [`TunnelConnector`] implement the
//! chain `Connector` contract so both protocols can be hops of a chain.

mod connector;
mod error;
mod handler;
mod mux;
mod pipe;
mod tunnel;
mod udp;

#[cfg(test)]
pub(crate) mod testing;

pub use connector::{BindListener, ConnectorOptions, RelayConnector};
pub use error::RelayError;
pub use handler::{ForwardHandler, ForwardOptions, Handler, RelayHandler, RelayOptions};
pub use mux::{MuxConfig, MuxSession, Session};
pub use tunnel::{
    Connector as PooledConnector, ConnectorPool, Dialed, Entrypoint, MAX_WEIGHT, TunnelConnector,
    TunnelDialer, TunnelHandler, TunnelOptions,
};
pub use udp::UdpRelay;
