//! Name resolution for netx.
//!
//! Provides a caching [`DnsResolver`] backed by
//! [`hickory-resolver`](https://crates.io/crates/hickory-resolver) that talks
//! to the system resolver or to [`Nameserver`]s over UDP, TCP, TLS or HTTPS,
//! and a [`StaticHosts`] table. Both implement the resolver contracts from
//! `netx_core::resolver`, so chains and handlers can use them directly.
//!
//! ```rust,no_run
//! use netx_core::resolver::Resolver;
//! use netx_dns::{DnsConfig, DnsResolver};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DnsConfig::with_servers(vec!["tls://1.1.1.1".into()]);
//! let resolver = DnsResolver::new(&config)?;
//! let ips = resolver.resolve("ip4", "example.com").await?;
//! println!("resolved: {ips:?}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod hosts;
pub mod resolver;

pub use config::{DnsConfig, Nameserver, Prefer, Scheme};
pub use error::DnsError;
pub use hosts::StaticHosts;
pub use resolver::DnsResolver;
