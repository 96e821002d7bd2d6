//! Generic node selection for netx.
//!
//! A [`DefaultSelector`] narrows a candidate list through a chain of
//! [`Filter`]s and then lets a [`Strategy`] pick one survivor. Candidates are
//! anything [`Selectable`]: hop nodes, chains in a chain group.
//!
//! Four strategies are built in: round-robin, weighted random, fifo and
//! hash. Two filters are built in: [`FailFilter`] drops candidates whose
//! [`Marker`] says they are dead, [`BackupFilter`] keeps backups out of
//! rotation until every primary is gone.

pub mod marker;

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use netx_core::metadata::Metadata;
use netx_core::{DEFAULT_FAIL_TIMEOUT_SECS, DEFAULT_MAX_FAILS, RequestCtx};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

pub use marker::Marker;

/// Metadata key: selection weight for the `rand` strategy.
pub const LABEL_WEIGHT: &str = "weight";
/// Metadata key: per-candidate failure threshold.
pub const LABEL_MAX_FAILS: &str = "maxFails";
/// Metadata key: per-candidate dead window.
pub const LABEL_FAIL_TIMEOUT: &str = "failTimeout";
/// Metadata key: marks a candidate as backup.
pub const LABEL_BACKUP: &str = "backup";

// ── Errors ──

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error("unknown selector strategy: {0}")]
    UnknownStrategy(String),
}

// ── Candidates ──

/// Something a selector can choose.
pub trait Selectable: Send + Sync {
    fn metadata(&self) -> &Metadata;

    /// Health marker, if the candidate tracks failures.
    fn marker(&self) -> Option<&Marker> {
        None
    }
}

impl<T: Selectable + ?Sized> Selectable for Arc<T> {
    fn metadata(&self) -> &Metadata {
        (**self).metadata()
    }

    fn marker(&self) -> Option<&Marker> {
        (**self).marker()
    }
}

// ── Traits ──

/// Picks one candidate. Returns `None` only for an empty list.
pub trait Strategy<T>: Send + Sync {
    fn apply(&self, ctx: &RequestCtx, candidates: &[T]) -> Option<T>;
}

/// Narrows the candidate list before the strategy runs.
pub trait Filter<T>: Send + Sync {
    fn filter(&self, ctx: &RequestCtx, candidates: Vec<T>) -> Vec<T>;
}

pub trait Selector<T>: Send + Sync {
    fn select(&self, ctx: &RequestCtx, candidates: &[T]) -> Option<T>;
}

// ── Strategy kind (for config) ──

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Round,
    Rand,
    Fifo,
    Hash,
}

impl FromStr for StrategyKind {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "round" | "rr" | "roundrobin" => Ok(Self::Round),
            "rand" | "random" => Ok(Self::Rand),
            "fifo" | "ha" => Ok(Self::Fifo),
            "hash" => Ok(Self::Hash),
            other => Err(SelectorError::UnknownStrategy(other.to_string())),
        }
    }
}

impl StrategyKind {
    pub fn build<T: Selectable + Clone + 'static>(self) -> Box<dyn Strategy<T>> {
        match self {
            Self::Round => Box::new(RoundRobin::new()),
            Self::Rand => Box::new(WeightedRandom),
            Self::Fifo => Box::new(Fifo),
            Self::Hash => Box::new(HashStrategy),
        }
    }
}

// ── Selector ──

/// Filters in order, then the strategy.
pub struct DefaultSelector<T> {
    strategy: Box<dyn Strategy<T>>,
    filters: Vec<Box<dyn Filter<T>>>,
}

impl<T: Selectable + Clone + 'static> DefaultSelector<T> {
    pub fn new(strategy: Box<dyn Strategy<T>>, filters: Vec<Box<dyn Filter<T>>>) -> Self {
        Self { strategy, filters }
    }

    /// The usual stack: fail filter, backup filter, then `kind`.
    pub fn standard(kind: StrategyKind, max_fails: i64, fail_timeout: Duration) -> Self {
        Self::new(
            kind.build(),
            vec![
                Box::new(FailFilter::new(max_fails, fail_timeout)),
                Box::new(BackupFilter),
            ],
        )
    }
}

impl<T: Selectable + Clone + 'static> Default for DefaultSelector<T> {
    fn default() -> Self {
        Self::standard(
            StrategyKind::Round,
            DEFAULT_MAX_FAILS,
            Duration::from_secs(DEFAULT_FAIL_TIMEOUT_SECS),
        )
    }
}

impl<T: Selectable + Clone> Selector<T> for DefaultSelector<T> {
    fn select(&self, ctx: &RequestCtx, candidates: &[T]) -> Option<T> {
        let mut list = candidates.to_vec();
        for f in &self.filters {
            list = f.filter(ctx, list);
            if list.is_empty() {
                return None;
            }
        }
        self.strategy.apply(ctx, &list)
    }
}

// ── Built-in strategies ──

/// Cycles through candidates with a shared counter.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicU64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T: Clone + Send + Sync> Strategy<T> for RoundRobin {
    fn apply(&self, _ctx: &RequestCtx, candidates: &[T]) -> Option<T> {
        if candidates.is_empty() {
            return None;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        candidates.get((n % candidates.len() as u64) as usize).cloned()
    }
}

/// Random pick proportional to the `weight` metadata (absent or <= 0 counts as 1).
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedRandom;

pub(crate) fn weight_of(md: &Metadata) -> u64 {
    let w = md.get_int(LABEL_WEIGHT);
    if w <= 0 { 1 } else { w as u64 }
}

/// Weighted pick over precomputed weights.
pub fn pick_weighted<R: Rng>(rng: &mut R, weights: &[u64]) -> Option<usize> {
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return None;
    }
    let mut roll = rng.random_range(0..total);
    for (i, w) in weights.iter().enumerate() {
        if roll < *w {
            return Some(i);
        }
        roll -= w;
    }
    None
}

impl<T: Selectable + Clone> Strategy<T> for WeightedRandom {
    fn apply(&self, _ctx: &RequestCtx, candidates: &[T]) -> Option<T> {
        let weights: Vec<u64> = candidates.iter().map(|c| weight_of(c.metadata())).collect();
        let idx = pick_weighted(&mut rand::rng(), &weights)?;
        candidates.get(idx).cloned()
    }
}

/// Always the first candidate; sticks to it until filters remove it.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fifo;

impl<T: Clone + Send + Sync> Strategy<T> for Fifo {
    fn apply(&self, _ctx: &RequestCtx, candidates: &[T]) -> Option<T> {
        candidates.first().cloned()
    }
}

/// `crc32(hash source) mod n` when the request carries a hash source,
/// uniform random otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashStrategy;

impl<T: Clone + Send + Sync> Strategy<T> for HashStrategy {
    fn apply(&self, ctx: &RequestCtx, candidates: &[T]) -> Option<T> {
        if candidates.is_empty() {
            return None;
        }
        let idx = match ctx.hash_source.as_deref() {
            Some(src) => {
                let h = crc32fast::hash(src.as_bytes()) as u64;
                trace!(source = src, hash = h, "hash strategy");
                (h % candidates.len() as u64) as usize
            }
            None => rand::rng().random_range(0..candidates.len()),
        };
        candidates.get(idx).cloned()
    }
}

// ── Built-in filters ──

/// Drops candidates considered dead by their marker.
///
/// Per-candidate metadata `maxFails` / `failTimeout` override the defaults;
/// values <= 0 fall back to 1 failure / the default timeout. Lists of one
/// candidate pass through untouched. When every candidate is dead the
/// result is empty unless [`FailFilter::degrade_when_all_dead`] is set, in
/// which case the unfiltered list is returned.
#[derive(Debug, Clone)]
pub struct FailFilter {
    max_fails: i64,
    fail_timeout: Duration,
    degrade: bool,
}

impl FailFilter {
    pub fn new(max_fails: i64, fail_timeout: Duration) -> Self {
        Self {
            max_fails,
            fail_timeout,
            degrade: false,
        }
    }

    pub fn degrade_when_all_dead(mut self, degrade: bool) -> Self {
        self.degrade = degrade;
        self
    }

    fn limits(&self, md: &Metadata) -> (i64, Duration) {
        let mut max_fails = self.max_fails;
        let mut fail_timeout = self.fail_timeout;
        if md.contains(LABEL_MAX_FAILS) {
            max_fails = md.get_int(LABEL_MAX_FAILS);
        }
        if md.contains(LABEL_FAIL_TIMEOUT) {
            fail_timeout = md.get_duration(LABEL_FAIL_TIMEOUT);
        }
        if max_fails <= 0 {
            max_fails = 1;
        }
        if fail_timeout.is_zero() {
            fail_timeout = Duration::from_secs(DEFAULT_FAIL_TIMEOUT_SECS);
        }
        (max_fails, fail_timeout)
    }
}

impl Default for FailFilter {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_FAILS,
            Duration::from_secs(DEFAULT_FAIL_TIMEOUT_SECS),
        )
    }
}

impl<T: Selectable + Clone> Filter<T> for FailFilter {
    fn filter(&self, _ctx: &RequestCtx, candidates: Vec<T>) -> Vec<T> {
        if candidates.len() <= 1 {
            return candidates;
        }
        let alive: Vec<T> = candidates
            .iter()
            .filter(|c| match c.marker() {
                Some(m) => {
                    let (max_fails, timeout) = self.limits(c.metadata());
                    !m.is_dead(max_fails, timeout)
                }
                None => true,
            })
            .cloned()
            .collect();
        if alive.is_empty() && self.degrade {
            return candidates;
        }
        alive
    }
}

/// Keeps `backup=true` candidates out unless nothing else is left.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackupFilter;

impl<T: Selectable + Clone> Filter<T> for BackupFilter {
    fn filter(&self, _ctx: &RequestCtx, candidates: Vec<T>) -> Vec<T> {
        if candidates.len() <= 1 {
            return candidates;
        }
        let (backups, primaries): (Vec<T>, Vec<T>) = candidates
            .into_iter()
            .partition(|c| c.metadata().get_bool(LABEL_BACKUP));
        if primaries.is_empty() { backups } else { primaries }
    }
}

// ── Tests ──
