//! Core types shared across netx crates.
//!
//! This crate provides:
//! - Default configuration values and metric error labels
//! - [`Metadata`] and the per-request [`RequestCtx`]
//! - The [`Conn`] / [`PacketConn`] connection abstractions and I/O helpers
//! - Contracts for the policy collaborators consumed by the routing engine
//!   (bypass, auth, limiters, resolver, host mapper, service discovery,
//!   ingress, observer) with small in-process implementations

pub mod auth;
pub mod bypass;
pub mod ctx;
pub mod defaults;
pub mod errors;
pub mod ingress;
pub mod io;
pub mod limiter;
pub mod metadata;
pub mod net;
pub mod observer;
pub mod resolver;
pub mod sd;

pub use ctx::RequestCtx;
pub use defaults::*;
pub use errors::*;
pub use metadata::Metadata;
pub use net::{Conn, Network, PacketConn};

/// Project name.
pub const PROJECT_NAME: &str = "netx";
/// Project version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
