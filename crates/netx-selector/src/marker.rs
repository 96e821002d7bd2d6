//! Lock-free failure marker for health tracking.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn now_millis() -> u64 {
    // +1 so that 0 can mean "never marked".
    epoch().elapsed().as_millis() as u64 + 1
}

/// Failure count plus the time of the last failure.
///
/// Count and timestamp are two independent atomics, so concurrent dial
/// attempts on the same node may interleave their updates. The marker is a
/// statistic for selection, not a transactional record.
#[derive(Debug, Default)]
pub struct Marker {
    count: AtomicI64,
    last_fail: AtomicU64,
}

impl Marker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure now.
    pub fn mark(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.last_fail.store(now_millis(), Ordering::Relaxed);
    }

    /// Forget past failures. The last failure time is kept.
    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Time since the last failure, `None` if never marked.
    pub fn since_last_fail(&self) -> Option<Duration> {
        match self.last_fail.load(Ordering::Relaxed) {
            0 => None,
            t => Some(Duration::from_millis(now_millis().saturating_sub(t))),
        }
    }

    /// Dead means at least `max_fails` failures, the latest within `fail_timeout`.
    pub fn is_dead(&self, max_fails: i64, fail_timeout: Duration) -> bool {
        if self.count() < max_fails {
            return false;
        }
        self.since_last_fail().is_some_and(|d| d < fail_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn mark_and_reset() {
        let m = Marker::new();
        assert_eq!(m.count(), 0);
        assert!(m.since_last_fail().is_none());

        m.mark();
        m.mark();
        assert_eq!(m.count(), 2);
        assert!(m.since_last_fail().unwrap() < Duration::from_secs(1));

        m.reset();
        assert_eq!(m.count(), 0);
        assert!(!m.is_dead(1, Duration::from_secs(60)));
    }

    #[test]
    fn dead_window_expires() {
        let m = Marker::new();
        m.mark();
        assert!(m.is_dead(1, Duration::from_millis(50)));
        std::thread::sleep(Duration::from_millis(70));
        assert!(!m.is_dead(1, Duration::from_millis(50)));
    }

    #[test]
    fn concurrent_marks_are_counted() {
        let m = Arc::new(Marker::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.mark();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.count(), 8000);
    }
}
