//! Stats events and the observer sink they are pushed to.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub total_conns: u64,
    pub current_conns: u64,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub total_errs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Per-client counters of a handler.
    Stats {
        service: String,
        client: String,
        stats: StatsSnapshot,
    },
    /// Lifecycle state of a service.
    Status { service: String, state: String },
}

#[derive(Debug, thiserror::Error)]
#[error("observer: {0}")]
pub struct ObserveError(pub String);

#[async_trait]
pub trait Observer: Send + Sync {
    async fn observe(&self, events: Vec<Event>) -> Result<(), ObserveError>;
}

#[async_trait]
impl<O: Observer + ?Sized> Observer for Arc<O> {
    async fn observe(&self, events: Vec<Event>) -> Result<(), ObserveError> {
        (**self).observe(events).await
    }
}

/// Observer that writes each event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

#[async_trait]
impl Observer for LogObserver {
    async fn observe(&self, events: Vec<Event>) -> Result<(), ObserveError> {
        for ev in events {
            match ev {
                Event::Stats {
                    service,
                    client,
                    stats,
                } => info!(
                    service = %service,
                    client = %client,
                    total_conns = stats.total_conns,
                    current_conns = stats.current_conns,
                    input_bytes = stats.input_bytes,
                    output_bytes = stats.output_bytes,
                    total_errs = stats.total_errs,
                    "stats"
                ),
                Event::Status { service, state } => info!(service = %service, state = %state, "status"),
            }
        }
        Ok(())
    }
}

/// Live counters for one client.
#[derive(Debug, Default)]
pub struct ClientStats {
    total_conns: AtomicU64,
    current_conns: AtomicU64,
    input_bytes: AtomicU64,
    output_bytes: AtomicU64,
    total_errs: AtomicU64,
    updated: AtomicBool,
}

impl ClientStats {
    pub fn conn_opened(&self) {
        self.total_conns.fetch_add(1, Ordering::Relaxed);
        self.current_conns.fetch_add(1, Ordering::Relaxed);
        self.updated.store(true, Ordering::Relaxed);
    }

    pub fn conn_closed(&self) {
        // Saturating: a close without a matching open must not wrap.
        let _ = self
            .current_conns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        self.updated.store(true, Ordering::Relaxed);
    }

    pub fn add_input(&self, n: u64) {
        self.input_bytes.fetch_add(n, Ordering::Relaxed);
        self.updated.store(true, Ordering::Relaxed);
    }

    pub fn add_output(&self, n: u64) {
        self.output_bytes.fetch_add(n, Ordering::Relaxed);
        self.updated.store(true, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.total_errs.fetch_add(1, Ordering::Relaxed);
        self.updated.store(true, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_conns: self.total_conns.load(Ordering::Relaxed),
            current_conns: self.current_conns.load(Ordering::Relaxed),
            input_bytes: self.input_bytes.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
            total_errs: self.total_errs.load(Ordering::Relaxed),
        }
    }
}

/// Per-client stats table of one handler.
#[derive(Debug, Default)]
pub struct HandlerStats {
    service: String,
    clients: RwLock<HashMap<String, Arc<ClientStats>>>,
}

impl HandlerStats {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn client(&self, client: &str) -> Arc<ClientStats> {
        if let Some(s) = self.clients.read().get(client) {
            return s.clone();
        }
        self.clients
            .write()
            .entry(client.to_string())
            .or_default()
            .clone()
    }

    /// Events for clients whose counters changed since the last call.
    pub fn take_events(&self) -> Vec<Event> {
        self.clients
            .read()
            .iter()
            .filter(|(_, s)| s.updated.swap(false, Ordering::Relaxed))
            .map(|(client, s)| Event::Stats {
                service: self.service.clone(),
                client: client.clone(),
                stats: s.snapshot(),
            })
            .collect()
    }
}
