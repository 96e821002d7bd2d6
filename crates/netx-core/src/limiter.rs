//! Rate and traffic limiting contracts plus token-bucket implementations.
//!
//! A [`RateLimiter`] counts requests per key (usually the client IP); a
//! [`TrafficLimiter`] budgets bytes per key and direction. Both hand out
//! per-key [`Limiter`] objects that callers consult before doing work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::debug;

/// A single budget.
pub trait Limiter: Send + Sync {
    /// Take `n` units if available right now.
    fn allow(&self, n: usize) -> bool;
    /// Take `n` units unconditionally, returning how long the caller should
    /// pause to stay within the budget.
    fn wait(&self, n: usize) -> Duration;
    /// Units per second; 0 means unlimited.
    fn limit(&self) -> u64;
}

pub trait RateLimiter: Send + Sync {
    fn limiter(&self, key: &str) -> Option<Arc<dyn Limiter>>;
}

pub trait TrafficLimiter: Send + Sync {
    /// Budget for bytes flowing from the client into the service.
    fn in_limiter(&self, key: &str) -> Option<Arc<dyn Limiter>>;
    /// Budget for bytes flowing back to the client.
    fn out_limiter(&self, key: &str) -> Option<Arc<dyn Limiter>>;
}

// ── Token bucket ──

struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Classic token bucket: refills at `rate` units/s up to `burst`.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate: u64, burst: u64) -> Self {
        let burst = burst.max(rate).max(1) as f64;
        Self {
            rate: rate as f64,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    fn refill(&self, st: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(st.last).as_secs_f64();
        st.last = now;
        st.tokens = (st.tokens + elapsed * self.rate).min(self.burst);
    }
}

impl Limiter for TokenBucket {
    fn allow(&self, n: usize) -> bool {
        if self.rate <= 0.0 {
            return true;
        }
        let mut st = self.state.lock();
        self.refill(&mut st);
        if st.tokens >= n as f64 {
            st.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    fn wait(&self, n: usize) -> Duration {
        if self.rate <= 0.0 {
            return Duration::ZERO;
        }
        let mut st = self.state.lock();
        self.refill(&mut st);
        st.tokens -= n as f64;
        if st.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-st.tokens / self.rate)
        }
    }

    fn limit(&self) -> u64 {
        self.rate as u64
    }
}

// ── Keyed buckets ──

struct Entry {
    bucket: Arc<TokenBucket>,
    last_used: Instant,
}

/// Lazily created per-key buckets with idle cleanup.
struct BucketMap {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    rate: u64,
    burst: u64,
}

impl BucketMap {
    fn new(rate: u64, burst: u64) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            rate,
            burst,
        }
    }

    fn get(&self, key: &str) -> Option<Arc<dyn Limiter>> {
        if self.rate == 0 {
            return None;
        }
        let now = Instant::now();
        let mut map = self.entries.write();
        let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
            bucket: Arc::new(TokenBucket::new(self.rate, self.burst)),
            last_used: now,
        });
        entry.last_used = now;
        Some(entry.bucket.clone())
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

fn spawn_cleanup(maps: Vec<Arc<RwLock<HashMap<String, Entry>>>>, idle: Duration, shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    debug!("limiter cleanup task shutting down");
                    break;
                }
                _ = tokio::time::sleep(idle) => {
                    let now = Instant::now();
                    for entries in &maps {
                        let mut map = entries.write();
                        let before = map.len();
                        map.retain(|_, e| now.duration_since(e.last_used) < idle);
                        let removed = before - map.len();
                        if removed > 0 {
                            debug!(removed, remaining = map.len(), "limiter entries cleaned up");
                        }
                    }
                }
            }
        }
    });
}

/// Requests per second per key.
pub struct KeyedRateLimiter {
    buckets: BucketMap,
    shutdown: Arc<Notify>,
}

impl KeyedRateLimiter {
    pub fn new(requests_per_sec: u64, burst: u64) -> Self {
        Self {
            buckets: BucketMap::new(requests_per_sec, burst),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Start dropping keys idle for longer than `idle`.
    pub fn start_cleanup_task(&self, idle: Duration) {
        spawn_cleanup(vec![self.buckets.entries.clone()], idle, self.shutdown.clone());
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl RateLimiter for KeyedRateLimiter {
    fn limiter(&self, key: &str) -> Option<Arc<dyn Limiter>> {
        self.buckets.get(key)
    }
}

impl Drop for KeyedRateLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Bytes per second per key and direction.
pub struct KeyedTrafficLimiter {
    inbound: BucketMap,
    outbound: BucketMap,
    shutdown: Arc<Notify>,
}

impl KeyedTrafficLimiter {
    /// A rate of 0 disables that direction.
    pub fn new(in_rate: u64, out_rate: u64) -> Self {
        Self {
            inbound: BucketMap::new(in_rate, in_rate),
            outbound: BucketMap::new(out_rate, out_rate),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn start_cleanup_task(&self, idle: Duration) {
        spawn_cleanup(
            vec![self.inbound.entries.clone(), self.outbound.entries.clone()],
            idle,
            self.shutdown.clone(),
        );
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl TrafficLimiter for KeyedTrafficLimiter {
    fn in_limiter(&self, key: &str) -> Option<Arc<dyn Limiter>> {
        self.inbound.get(key)
    }

    fn out_limiter(&self, key: &str) -> Option<Arc<dyn Limiter>> {
        self.outbound.get(key)
    }
}

impl Drop for KeyedTrafficLimiter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_allows_burst_then_blocks() {
        let b = TokenBucket::new(1, 3);
        assert!(b.allow(1));
        assert!(b.allow(1));
        assert!(b.allow(1));
        assert!(!b.allow(1));
    }

    #[test]
    fn bucket_wait_reports_deficit() {
        let b = TokenBucket::new(1000, 1000);
        assert_eq!(b.wait(1000), Duration::ZERO);
        let d = b.wait(500);
        assert!(d > Duration::from_millis(400) && d <= Duration::from_millis(500), "{d:?}");
    }

    #[test]
    fn keys_get_independent_budgets() {
        let rl = KeyedRateLimiter::new(2, 2);
        let a = rl.limiter("10.0.0.1").unwrap();
        assert!(a.allow(1) && a.allow(1));
        assert!(!a.allow(1));

        let b = rl.limiter("10.0.0.2").unwrap();
        assert!(b.allow(1));
        assert!(!rl.limiter("10.0.0.1").unwrap().allow(1));
        assert_eq!(rl.tracked_keys(), 2);
    }

    #[test]
    fn zero_rate_disables_direction() {
        let tl = KeyedTrafficLimiter::new(0, 1024);
        assert!(tl.in_limiter("k").is_none());
        assert_eq!(tl.out_limiter("k").unwrap().limit(), 1024);
    }

    #[tokio::test]
    async fn cleanup_drops_idle_keys() {
        let rl = KeyedRateLimiter::new(10, 10);
        rl.start_cleanup_task(Duration::from_millis(30));
        rl.limiter("a");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rl.tracked_keys(), 0);
    }
}
