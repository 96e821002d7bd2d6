//! Whole-process runtime: build every service from a config, bind them, and
//! serve until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use netx_chain::Hop;
use netx_config::Config;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::builder::Builder;
use crate::error::ServerError;
use crate::registry::Registry;
use crate::service::{BoundService, Service};

/// All services of one config, built but not yet listening.
pub struct Server {
    registry: Registry,
    services: Vec<Service>,
    hops: Vec<Arc<Hop>>,
}

impl Server {
    /// Build the object graph. Must be called inside a tokio runtime.
    pub fn build(config: &Config, registry: Registry) -> Result<Self, ServerError> {
        let built = Builder::new(config, registry).build()?;
        Ok(Self {
            registry: built.registry,
            services: built.services,
            hops: built.hops,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Every hop in the graph, including inline ones.
    pub fn hops(&self) -> &[Arc<Hop>] {
        &self.hops
    }

    /// Bind every service. Fails on the first listener that cannot bind.
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let mut services = Vec::with_capacity(self.services.len());
        for svc in self.services {
            let name = svc.name().to_string();
            let bound = svc.bind().await.inspect_err(|e| {
                error!(service = %name, error = %e, "failed to bind service");
            })?;
            match bound.local_addr() {
                Some(addr) => info!(service = %name, %addr, "service listening"),
                None => info!(service = %name, "service listening"),
            }
            services.push(bound);
        }
        Ok(BoundServer {
            services,
            hops: self.hops,
        })
    }
}

pub struct BoundServer {
    services: Vec<BoundService>,
    hops: Vec<Arc<Hop>>,
}

impl BoundServer {
    pub fn local_addr(&self, service: &str) -> Option<SocketAddr> {
        self.services
            .iter()
            .find(|s| s.name() == service)
            .and_then(|s| s.local_addr())
    }

    /// Serve every service and run hop reloaders until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let mut reloaders = JoinSet::new();
        for hop in &self.hops {
            if let Some(handle) = hop.spawn_reload(shutdown.clone()) {
                reloaders.spawn(async move {
                    let _ = handle.await;
                });
            }
        }

        let mut tasks = JoinSet::new();
        for svc in self.services {
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let name = svc.name().to_string();
                (name, svc.serve(shutdown).await)
            });
        }

        let mut first_err = None;
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => {
                    error!(service = %name, error = %e, "service failed");
                    // one failed service takes the rest down with it
                    shutdown.cancel();
                    first_err.get_or_insert(e);
                }
                Err(e) => {
                    warn!(error = %e, "service task panicked");
                    shutdown.cancel();
                }
            }
        }

        shutdown.cancel();
        while reloaders.join_next().await.is_some() {}
        info!("server stopped");
        first_err.map_or(Ok(()), Err)
    }
}

/// Build, bind and serve `config` until `shutdown` fires.
pub async fn run_with_shutdown(
    config: &Config,
    registry: Registry,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let server = Server::build(config, registry)?;
    info!(
        services = server.services.len(),
        hops = server.hops.len(),
        "starting server"
    );
    server.bind().await?.serve(shutdown).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use netx_config::parse_config;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    #[tokio::test]
    async fn forward_service_pipes_to_target() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let cfg = parse_config(
            &format!(
                r#"
services:
  - name: fwd
    addr: "127.0.0.1:0"
    handler: {{type: forward}}
    forwarder:
      nodes: [{{name: t, addr: "{target_addr}"}}]
"#
            ),
            "yaml",
        )
        .unwrap();

        let bound = Server::build(&cfg, Registry::with_defaults())
            .unwrap()
            .bind()
            .await
            .unwrap();
        let addr = bound.local_addr("fwd").unwrap();
        assert!(bound.local_addr("other").is_none());

        let shutdown = CancellationToken::new();
        let server = tokio::spawn(bound.serve(shutdown.clone()));

        let mut c = TcpStream::connect(addr).await.unwrap();
        c.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        c.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(c);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn serve_runs_hop_reloaders() {
        let f = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        std::fs::write(f.path(), "- {name: a, addr: \"10.0.0.1:8420\"}\n").unwrap();
        let cfg = parse_config(
            &format!(
                r#"
services:
  - name: fwd
    addr: "127.0.0.1:0"
    handler: {{type: forward}}
    forwarder:
      nodes: [{{name: t, addr: "127.0.0.1:9"}}]
hops:
  - name: h
    file: {{path: "{}"}}
    reload: 50ms
"#,
                f.path().display()
            ),
            "yaml",
        )
        .unwrap();

        let server = Server::build(&cfg, Registry::with_defaults()).unwrap();
        let hop = server.registry().hops.get("h").unwrap();
        assert!(hop.nodes().is_empty());

        let bound = server.bind().await.unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(bound.serve(shutdown.clone()));

        let wait_for = |n: usize| {
            let hop = hop.clone();
            async move {
                for _ in 0..100 {
                    if hop.nodes().len() == n {
                        return true;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                false
            }
        };
        assert!(wait_for(1).await, "initial load never happened");

        std::fs::write(
            f.path(),
            "- {name: a, addr: \"10.0.0.1:8420\"}\n- {name: b, addr: \"10.0.0.2:8420\"}\n",
        )
        .unwrap();
        assert!(wait_for(2).await, "periodic reload never happened");
        assert!(hop.node("b").is_some());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cfg = parse_config(
            &format!(
                "services: [{{name: s, addr: \"{}\", handler: {{type: relay}}}}]",
                taken.local_addr().unwrap()
            ),
            "yaml",
        )
        .unwrap();
        let server = Server::build(&cfg, Registry::with_defaults()).unwrap();
        assert!(matches!(server.bind().await, Err(ServerError::Io(_))));
    }
}
