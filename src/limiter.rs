//! Per-source-address admission rate limiting
//!
//! Limiting only delays, it never rejects: a burst from one address is
//! queued so that admissions are spaced at least the configured interval
//! apart. State is independent of container state, so a limited client can
//! still reach a warm container once admitted.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Entries whose next-allowed time lies this many intervals in the past are
/// considered stale and dropped by [`RateLimiter::prune`].
const STALE_INTERVALS: u32 = 10;

/// Enforces a minimum spacing between admissions per session key.
pub struct RateLimiter {
    interval: Duration,
    /// key -> earliest time the next admission may proceed
    next_allowed: DashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_allowed: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Suspend the caller until `key` is allowed to proceed.
    ///
    /// The stored next-allowed time is advanced to `max(now, previous) +
    /// interval` while the entry lock is held, so two concurrent admissions
    /// for the same key always observe each other. The sleep itself happens
    /// outside the lock.
    pub async fn admit(&self, key: &str) {
        if !self.enabled() {
            return;
        }

        let wait = {
            let now = Instant::now();
            let mut entry = self.next_allowed.entry(key.to_string()).or_insert(now);
            let wait = entry.saturating_duration_since(now);
            *entry = (*entry).max(now) + self.interval;
            wait
        };

        if !wait.is_zero() {
            debug!(key, wait_ms = wait.as_millis() as u64, "rate limited, delaying admission");
            tokio::time::sleep(wait).await;
        }
    }

    /// Drop entries for addresses that have not been admitted in a long
    /// time. The map otherwise grows with source-address cardinality.
    ///
    /// Returns how many entries were dropped. Removals are counted inside
    /// `retain` rather than by comparing map lengths; admissions insert
    /// concurrently, so a before/after length difference can go negative.
    pub fn prune(&self) -> usize {
        if !self.enabled() {
            return 0;
        }
        let now = Instant::now();
        let horizon = self.interval * STALE_INTERVALS;
        let mut dropped = 0;
        self.next_allowed.retain(|_, next| {
            let stale = now.saturating_duration_since(*next) >= horizon;
            if stale {
                dropped += 1;
            }
            !stale
        });
        if dropped > 0 {
            debug!(dropped, remaining = self.next_allowed.len(), "pruned stale rate-limit entries");
        }
        dropped
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.next_allowed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_limiter_is_noop() {
        let limiter = RateLimiter::new(Duration::ZERO);
        assert!(!limiter.enabled());

        let start = Instant::now();
        limiter.admit("10.0.0.1").await;
        limiter.admit("10.0.0.1").await;
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admissions_are_spaced() {
        let limiter = RateLimiter::new(Duration::from_millis(500));

        let start = Instant::now();
        limiter.admit("10.0.0.1").await;
        let first = start.elapsed();
        limiter.admit("10.0.0.1").await;
        let second = start.elapsed();
        limiter.admit("10.0.0.1").await;
        let third = start.elapsed();

        // first admission is immediate, each later one waits a full interval
        assert!(first < Duration::from_millis(10));
        assert!(second >= Duration::from_millis(500));
        assert!(third >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(Duration::from_millis(500));

        limiter.admit("10.0.0.1").await;
        let start = Instant::now();
        limiter.admit("10.0.0.2").await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_resets_after_quiet_period() {
        let limiter = RateLimiter::new(Duration::from_millis(100));

        limiter.admit("10.0.0.1").await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let start = Instant::now();
        limiter.admit("10.0.0.1").await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_drops_stale_entries() {
        let limiter = RateLimiter::new(Duration::from_millis(100));

        limiter.admit("10.0.0.1").await;
        limiter.admit("10.0.0.2").await;
        assert_eq!(limiter.tracked_keys(), 2);

        // fresh entries survive a sweep
        assert_eq!(limiter.prune(), 0);
        assert_eq!(limiter.tracked_keys(), 2);

        tokio::time::sleep(Duration::from_millis(100 * 10 + 100)).await;
        assert_eq!(limiter.prune(), 2);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_counts_only_stale_removals() {
        let limiter = RateLimiter::new(Duration::from_millis(100));

        limiter.admit("10.0.0.1").await;
        limiter.admit("10.0.0.2").await;
        tokio::time::sleep(Duration::from_millis(100 * 10 + 100)).await;

        // a key admitted after the stale ones must neither be dropped nor
        // skew the removal count
        limiter.admit("10.0.0.3").await;

        assert_eq!(limiter.prune(), 2);
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
