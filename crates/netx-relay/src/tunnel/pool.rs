//! Live tunnel connectors, grouped by tunnel id.
//!
//! A connector is one BIND session from a tunnel client, held on a lease of
//! `ttl`. Lookups skip expired connectors and purge dead ones on the way.
//! Only the connector's owner extends the lease ([`ConnectorPool::renew`]);
//! the periodic sweep evicts expired and dead connectors, renews the
//! discovery records of the rest and drops tunnels with nothing left.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use netx_core::Network;
use netx_core::sd::{Service, ServiceDiscovery};
use netx_metrics::set_tunnel_connectors;
use netx_proto::{ConnectorId, TunnelId};
use netx_selector::pick_weighted;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::mux::Session;

/// Connectors with this weight take every request while any is alive.
pub const MAX_WEIGHT: u8 = 0xff;

pub struct Connector {
    id: ConnectorId,
    tunnel: TunnelId,
    node: String,
    session: Arc<dyn Session>,
    sd: Option<Arc<dyn ServiceDiscovery>>,
    /// Relay address advertised to other nodes.
    address: String,
}

impl Connector {
    pub fn new(id: ConnectorId, tunnel: TunnelId, node: impl Into<String>, session: Arc<dyn Session>) -> Self {
        Self {
            id,
            tunnel,
            node: node.into(),
            session,
            sd: None,
            address: String::new(),
        }
    }

    pub fn with_sd(mut self, sd: Arc<dyn ServiceDiscovery>, address: impl Into<String>) -> Self {
        self.sd = Some(sd);
        self.address = address.into();
        self
    }

    pub fn id(&self) -> ConnectorId {
        self.id
    }

    pub fn tunnel(&self) -> TunnelId {
        self.tunnel
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn network(&self) -> Network {
        if self.id.is_udp() {
            Network::Udp
        } else {
            Network::Tcp
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.session.is_closed()
    }

    /// Discovery record for this connector.
    pub fn service(&self) -> Service {
        Service {
            id: self.id.to_string(),
            name: self.tunnel.to_string(),
            node: self.node.clone(),
            network: self.network().to_string(),
            address: self.address.clone(),
        }
    }

    pub async fn register(&self) {
        if let Some(sd) = &self.sd
            && let Err(e) = sd.register(&self.service()).await
        {
            warn!(tunnel = %self.tunnel, connector = %self.id, error = %e, "sd register failed");
        }
    }

    pub async fn renew(&self) {
        if let Some(sd) = &self.sd
            && let Err(e) = sd.renew(&self.service()).await
        {
            debug!(tunnel = %self.tunnel, connector = %self.id, error = %e, "sd renew failed");
        }
    }

    pub async fn deregister(&self) {
        if let Some(sd) = &self.sd
            && let Err(e) = sd.deregister(&self.service()).await
        {
            debug!(tunnel = %self.tunnel, connector = %self.id, error = %e, "sd deregister failed");
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("id", &self.id.to_string())
            .field("tunnel", &self.tunnel.to_string())
            .field("node", &self.node)
            .field("alive", &self.is_alive())
            .finish()
    }
}

struct Entry {
    connector: Arc<Connector>,
    expires: Instant,
}

fn matches_network(c: &Connector, network: Network) -> bool {
    c.id.is_udp() == network.is_udp()
}

#[derive(Default)]
pub struct ConnectorPool {
    tunnels: Mutex<HashMap<TunnelId, Vec<Entry>>>,
}

impl ConnectorPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tunnel: TunnelId, connector: Arc<Connector>, ttl: Duration) {
        let total = {
            let mut tunnels = self.tunnels.lock();
            tunnels.entry(tunnel.canonical()).or_default().push(Entry {
                connector,
                expires: Instant::now() + ttl,
            });
            tunnels.values().map(Vec::len).sum()
        };
        set_tunnel_connectors(total);
    }

    /// Weighted pick among live connectors of `tunnel` serving `network`.
    pub fn get(&self, network: Network, tunnel: &TunnelId) -> Option<Arc<Connector>> {
        let now = Instant::now();
        let mut tunnels = self.tunnels.lock();
        let entries = tunnels.get_mut(&tunnel.canonical())?;
        entries.retain(|e| {
            let alive = e.connector.is_alive();
            if !alive {
                debug!(tunnel = %tunnel, connector = %e.connector.id, "purge dead connector");
            }
            alive
        });

        let mut candidates: Vec<&Arc<Connector>> = Vec::new();
        let mut weights: Vec<u64> = Vec::new();
        let mut exclusive = false;
        for e in entries.iter() {
            if e.expires <= now || !matches_network(&e.connector, network) {
                continue;
            }
            let weight = e.connector.id.weight();
            if weight == MAX_WEIGHT && !exclusive {
                candidates.clear();
                weights.clear();
                exclusive = true;
            }
            if weight == MAX_WEIGHT || !exclusive {
                candidates.push(&e.connector);
                weights.push(u64::from(weight.max(1)));
            }
        }

        let idx = pick_weighted(&mut rand::rng(), &weights)?;
        candidates.get(idx).map(|c| Arc::clone(c))
    }

    /// Number of connectors currently held, dead or alive.
    pub fn len(&self) -> usize {
        self.tunnels.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extend the lease of connector `id` to `ttl` from now. False once the
    /// connector has been evicted.
    pub fn renew(&self, tunnel: &TunnelId, id: ConnectorId, ttl: Duration) -> bool {
        let mut tunnels = self.tunnels.lock();
        let Some(entry) = tunnels
            .get_mut(&tunnel.canonical())
            .and_then(|entries| entries.iter_mut().find(|e| e.connector.id == id))
        else {
            return false;
        };
        entry.expires = Instant::now() + ttl;
        true
    }

    /// Evict dead and expired connectors, drop empty tunnels and renew the
    /// discovery records of what is left. Returns the connectors kept.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut live: Vec<Arc<Connector>> = Vec::new();
        let mut evicted: Vec<Arc<Connector>> = Vec::new();
        let total = {
            let mut tunnels = self.tunnels.lock();
            tunnels.retain(|tid, entries| {
                entries.retain(|e| {
                    if !e.connector.is_alive() || e.expires <= now {
                        debug!(tunnel = %tid, connector = %e.connector.id, "remove connector");
                        evicted.push(e.connector.clone());
                        return false;
                    }
                    live.push(e.connector.clone());
                    true
                });
                !entries.is_empty()
            });
            tunnels.values().map(Vec::len).sum()
        };
        set_tunnel_connectors(total);

        for c in &evicted {
            c.deregister().await;
        }
        for c in &live {
            c.renew().await;
        }
        total
    }

    /// Sweep every `ttl / 2` until `shutdown` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, ttl: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = lease_period(ttl);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        pool.sweep().await;
                    }
                }
            }
        })
    }
}

/// Interval for sweeps and lease renewals.
pub(crate) fn lease_period(ttl: Duration) -> Duration {
    (ttl / 2).max(Duration::from_millis(10))
}

impl std::fmt::Debug for ConnectorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorPool")
            .field("connectors", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSession;
    use netx_core::sd::MemorySd;

    const TID: &str = "3b6ec2a8-6b1c-4a5e-9d2f-0c1d2e3f4a5b";

    fn connector(id: ConnectorId, session: Arc<FakeSession>) -> Arc<Connector> {
        Arc::new(Connector::new(id, TID.parse().unwrap(), "node-a", session))
    }

    #[tokio::test]
    async fn get_filters_network_and_dead_sessions() {
        let pool = ConnectorPool::new();
        let tid: TunnelId = TID.parse().unwrap();
        let dead = Arc::new(FakeSession::default());
        pool.add(tid, connector(ConnectorId::new(), dead.clone()), Duration::from_secs(15));
        let tcp_id = ConnectorId::new();
        pool.add(tid, connector(tcp_id, Arc::default()), Duration::from_secs(15));
        let udp_id = ConnectorId::new_udp();
        pool.add(tid, connector(udp_id, Arc::default()), Duration::from_secs(15));
        dead.close();

        for _ in 0..20 {
            assert_eq!(pool.get(Network::Tcp, &tid).unwrap().id(), tcp_id);
        }
        assert_eq!(pool.get(Network::Udp, &tid).unwrap().id(), udp_id);
        // the dead connector was purged on lookup
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn private_flag_shares_bucket() {
        let pool = ConnectorPool::new();
        let private: TunnelId = format!("${TID}").parse().unwrap();
        let public: TunnelId = TID.parse().unwrap();
        pool.add(private, connector(ConnectorId::new(), Arc::default()), Duration::from_secs(15));
        assert!(pool.get(Network::Tcp, &public).is_some());
    }

    #[tokio::test]
    async fn max_weight_is_exclusive() {
        let pool = ConnectorPool::new();
        let tid: TunnelId = TID.parse().unwrap();
        let heavy = ConnectorId::new().with_weight(MAX_WEIGHT);
        pool.add(tid, connector(ConnectorId::new().with_weight(200), Arc::default()), Duration::from_secs(15));
        pool.add(tid, connector(heavy, Arc::default()), Duration::from_secs(15));
        for _ in 0..50 {
            assert_eq!(pool.get(Network::Tcp, &tid).unwrap().id(), heavy);
        }
    }

    #[tokio::test]
    async fn sweep_drops_dead_and_renews_live() {
        let pool = ConnectorPool::new();
        let tid: TunnelId = TID.parse().unwrap();
        let sd = Arc::new(MemorySd::new(Duration::from_secs(60)));
        let live = Arc::new(
            Connector::new(ConnectorId::new(), tid, "node-a", Arc::new(FakeSession::default()))
                .with_sd(sd.clone(), "10.0.0.1:8443"),
        );
        live.register().await;
        let dead_session = Arc::new(FakeSession::default());
        pool.add(tid, live.clone(), Duration::from_secs(15));
        pool.add(tid, connector(ConnectorId::new(), dead_session.clone()), Duration::from_secs(15));
        dead_session.close();

        assert_eq!(pool.sweep().await, 1);
        let services = sd.get(&tid.to_string()).await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].address, "10.0.0.1:8443");
        assert_eq!(services[0].network, "tcp");

        live.session().close();
        assert_eq!(pool.sweep().await, 0);
        assert!(pool.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_connectors_are_skipped() {
        let pool = ConnectorPool::new();
        let tid: TunnelId = TID.parse().unwrap();
        pool.add(tid, connector(ConnectorId::new(), Arc::default()), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(pool.get(Network::Tcp, &tid).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expires_under_running_sweeper() {
        let pool = Arc::new(ConnectorPool::new());
        let tid: TunnelId = TID.parse().unwrap();
        let ttl = Duration::from_millis(100);
        let shutdown = CancellationToken::new();
        pool.add(tid, connector(ConnectorId::new(), Arc::default()), ttl);
        pool.spawn_sweeper(ttl, shutdown.clone());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(pool.get(Network::Tcp, &tid).is_some());

        // ttl plus one sweep interval
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pool.get(Network::Tcp, &tid).is_none());
        assert!(pool.is_empty());
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn renewed_lease_outlives_ttl() {
        let pool = Arc::new(ConnectorPool::new());
        let tid: TunnelId = TID.parse().unwrap();
        let id = ConnectorId::new();
        let ttl = Duration::from_millis(100);
        let shutdown = CancellationToken::new();
        pool.add(tid, connector(id, Arc::default()), ttl);
        pool.spawn_sweeper(ttl, shutdown.clone());

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(pool.renew(&tid, id, ttl));
        }
        assert!(pool.get(Network::Tcp, &tid).is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!pool.renew(&tid, id, ttl));
        assert!(pool.get(Network::Tcp, &tid).is_none());
        shutdown.cancel();
    }
}
