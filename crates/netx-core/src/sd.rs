//! Service discovery contract used for cross-node tunnel dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;

/// One advertised tunnel connector.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Service {
    /// Connector id.
    pub id: String,
    /// Tunnel id.
    pub name: String,
    /// Node that holds the connector.
    pub node: String,
    pub network: String,
    /// Relay address other nodes dial to reach `node`.
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SdError {
    #[error("sd: service {0} not registered")]
    NotRegistered(String),
    #[error("sd: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    async fn register(&self, service: &Service) -> Result<(), SdError>;
    async fn deregister(&self, service: &Service) -> Result<(), SdError>;
    async fn renew(&self, service: &Service) -> Result<(), SdError>;
    /// All live services registered under `name`.
    async fn get(&self, name: &str) -> Result<Vec<Service>, SdError>;
}

#[async_trait]
impl<S: ServiceDiscovery + ?Sized> ServiceDiscovery for Arc<S> {
    async fn register(&self, service: &Service) -> Result<(), SdError> {
        (**self).register(service).await
    }
    async fn deregister(&self, service: &Service) -> Result<(), SdError> {
        (**self).deregister(service).await
    }
    async fn renew(&self, service: &Service) -> Result<(), SdError> {
        (**self).renew(service).await
    }
    async fn get(&self, name: &str) -> Result<Vec<Service>, SdError> {
        (**self).get(name).await
    }
}

struct Record {
    service: Service,
    renewed: Instant,
}

/// Process-local registry. Entries not renewed within `ttl` are hidden from
/// `get` and dropped on the next write; a zero `ttl` keeps them forever.
pub struct MemorySd {
    services: RwLock<HashMap<String, Vec<Record>>>,
    ttl: Duration,
}

impl MemorySd {
    pub fn new(ttl: Duration) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    fn alive(&self, rec: &Record, now: Instant) -> bool {
        self.ttl.is_zero() || now.duration_since(rec.renewed) < self.ttl
    }
}

impl Default for MemorySd {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[async_trait]
impl ServiceDiscovery for MemorySd {
    async fn register(&self, service: &Service) -> Result<(), SdError> {
        let now = Instant::now();
        let mut map = self.services.write();
        let bucket = map.entry(service.name.clone()).or_default();
        bucket.retain(|r| r.service.id != service.id && self.alive(r, now));
        bucket.push(Record {
            service: service.clone(),
            renewed: now,
        });
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<(), SdError> {
        let mut map = self.services.write();
        if let Some(bucket) = map.get_mut(&service.name) {
            bucket.retain(|r| r.service.id != service.id);
            if bucket.is_empty() {
                map.remove(&service.name);
            }
        }
        Ok(())
    }

    async fn renew(&self, service: &Service) -> Result<(), SdError> {
        let mut map = self.services.write();
        let rec = map
            .get_mut(&service.name)
            .and_then(|b| b.iter_mut().find(|r| r.service.id == service.id))
            .ok_or_else(|| SdError::NotRegistered(service.id.clone()))?;
        rec.renewed = Instant::now();
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<Service>, SdError> {
        let now = Instant::now();
        Ok(self
            .services
            .read()
            .get(name)
            .map(|b| {
                b.iter()
                    .filter(|r| self.alive(r, now))
                    .map(|r| r.service.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}
