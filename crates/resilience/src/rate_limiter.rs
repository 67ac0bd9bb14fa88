//! Sliding-window rate limiter.
//!
//! Pure counters keyed by an opaque string (the caller composes scope and
//! key, e.g. `"llm:conv_42"` or `"dispatch:conv_42"`). `check_and_record`
//! atomically tests and, if under the limit, records the event — two racing
//! callers on the same key serialize on that key's shard, so the limit is
//! never overshot. Expired entries are pruned on access; a periodic `sweep`
//! bounds memory but is not required for correctness.

use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use hivemind_core::error::GateError;

const SHARD_COUNT: usize = 16;

/// Sliding-window counters, one window per key.
pub struct RateLimiter {
    shards: Vec<Mutex<HashMap<String, VecDeque<Instant>>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    /// Atomically test and record one event. `Ok` means the event was
    /// admitted and counted; `Err` means nothing was recorded.
    pub fn check_and_record(
        &self,
        key: &str,
        window: Duration,
        limit: usize,
    ) -> Result<(), GateError> {
        self.check_and_record_n_at(key, window, limit, 1, Instant::now())
    }

    /// Reserve `n` slots atomically — all or nothing. Used for batch
    /// dispatch, where starting half a wave is worse than starting none.
    pub fn check_and_record_n(
        &self,
        key: &str,
        window: Duration,
        limit: usize,
        n: usize,
    ) -> Result<(), GateError> {
        self.check_and_record_n_at(key, window, limit, n, Instant::now())
    }

    pub(crate) fn check_and_record_n_at(
        &self,
        key: &str,
        window: Duration,
        limit: usize,
        n: usize,
        now: Instant,
    ) -> Result<(), GateError> {
        let mut shard = self.shard(key);
        let entries = shard.entry(key.to_string()).or_default();

        // Lazy prune: drop everything older than the window.
        while let Some(&oldest) = entries.front() {
            if now.duration_since(oldest) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }

        if entries.len() + n > limit {
            let retry_after_ms = entries
                .front()
                .map(|&oldest| {
                    window
                        .saturating_sub(now.duration_since(oldest))
                        .as_millis() as u64
                })
                .unwrap_or(0);
            debug!(key, occupancy = entries.len(), limit, "Rate limited");
            return Err(GateError::RateLimited {
                key: key.to_string(),
                retry_after_ms,
            });
        }

        for _ in 0..n {
            entries.push_back(now);
        }
        Ok(())
    }

    /// Drop windows whose newest entry is older than `max_idle`. Optional:
    /// correctness only needs lazy pruning, this bounds memory for keys that
    /// stop arriving.
    pub fn sweep(&self, max_idle: Duration) {
        self.sweep_at(max_idle, Instant::now());
    }

    pub(crate) fn sweep_at(&self, max_idle: Duration, now: Instant) {
        for shard in &self.shards {
            shard.lock().unwrap().retain(|_, entries| {
                entries
                    .back()
                    .is_some_and(|&newest| now.duration_since(newest) < max_idle)
            });
        }
    }

    /// Number of tracked keys, for observability.
    pub fn tracked_keys(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    fn shard(&self, key: &str) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % SHARD_COUNT;
        self.shards[idx].lock().unwrap()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(10);

    #[test]
    fn admits_up_to_limit_then_rejects() {
        let rl = RateLimiter::new();
        let now = Instant::now();

        for _ in 0..5 {
            assert!(rl.check_and_record_n_at("k", WINDOW, 5, 1, now).is_ok());
        }
        let err = rl.check_and_record_n_at("k", WINDOW, 5, 1, now).unwrap_err();
        assert!(matches!(err, GateError::RateLimited { .. }));
    }

    #[test]
    fn rejected_calls_are_not_counted() {
        let rl = RateLimiter::new();
        let now = Instant::now();

        for _ in 0..3 {
            rl.check_and_record_n_at("k", WINDOW, 3, 1, now).unwrap();
        }
        // A burst of rejections must not extend the occupancy.
        for _ in 0..10 {
            assert!(rl.check_and_record_n_at("k", WINDOW, 3, 1, now).is_err());
        }
        let later = now + Duration::from_secs(10);
        assert!(rl.check_and_record_n_at("k", WINDOW, 3, 1, later).is_ok());
    }

    #[test]
    fn window_slides() {
        let rl = RateLimiter::new();
        let start = Instant::now();

        rl.check_and_record_n_at("k", WINDOW, 2, 1, start).unwrap();
        rl.check_and_record_n_at("k", WINDOW, 2, 1, start + Duration::from_secs(5))
            .unwrap();
        assert!(
            rl.check_and_record_n_at("k", WINDOW, 2, 1, start + Duration::from_secs(6))
                .is_err()
        );
        // First entry expires at start+10; one slot frees up.
        assert!(
            rl.check_and_record_n_at("k", WINDOW, 2, 1, start + Duration::from_secs(11))
                .is_ok()
        );
    }

    #[test]
    fn no_sliding_interval_exceeds_the_limit() {
        // Property check over a fixed arrival script: admitted timestamps
        // must never put more than `limit` inside any window-length interval.
        let rl = RateLimiter::new();
        let start = Instant::now();
        let limit = 3;
        let mut admitted: Vec<Duration> = Vec::new();

        for tick in 0..40u64 {
            let offset = Duration::from_millis(tick * 700);
            if rl
                .check_and_record_n_at("k", WINDOW, limit, 1, start + offset)
                .is_ok()
            {
                admitted.push(offset);
            }
        }

        for (i, &t) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|&&u| u - t < WINDOW)
                .count();
            assert!(in_window <= limit, "{in_window} admissions within one window");
        }
    }

    #[test]
    fn multi_count_reserve_is_all_or_nothing() {
        let rl = RateLimiter::new();
        let now = Instant::now();

        rl.check_and_record_n_at("k", WINDOW, 5, 3, now).unwrap();
        // 3 used, 2 free: a batch of 3 must be rejected whole.
        assert!(rl.check_and_record_n_at("k", WINDOW, 5, 3, now).is_err());
        // ...and must not have consumed the remaining slots.
        assert!(rl.check_and_record_n_at("k", WINDOW, 5, 2, now).is_ok());
    }

    #[test]
    fn rate_limited_reports_retry_hint() {
        let rl = RateLimiter::new();
        let start = Instant::now();

        rl.check_and_record_n_at("k", WINDOW, 1, 1, start).unwrap();
        let err = rl
            .check_and_record_n_at("k", WINDOW, 1, 1, start + Duration::from_secs(4))
            .unwrap_err();
        match err {
            GateError::RateLimited { retry_after_ms, .. } => {
                assert_eq!(retry_after_ms, 6_000);
            }
            other => panic!("unexpected gate error: {other:?}"),
        }
    }

    #[test]
    fn keys_are_independent() {
        let rl = RateLimiter::new();
        let now = Instant::now();

        rl.check_and_record_n_at("a", WINDOW, 1, 1, now).unwrap();
        assert!(rl.check_and_record_n_at("b", WINDOW, 1, 1, now).is_ok());
    }

    #[test]
    fn sweep_drops_stale_windows() {
        let rl = RateLimiter::new();
        let start = Instant::now();

        rl.check_and_record_n_at("stale", WINDOW, 5, 1, start).unwrap();
        rl.check_and_record_n_at("fresh", WINDOW, 5, 1, start + Duration::from_secs(50))
            .unwrap();
        assert_eq!(rl.tracked_keys(), 2);

        rl.sweep_at(Duration::from_secs(30), start + Duration::from_secs(60));
        assert_eq!(rl.tracked_keys(), 1);

        // A swept key is recreated on next use.
        assert!(
            rl.check_and_record_n_at("stale", WINDOW, 5, 1, start + Duration::from_secs(61))
                .is_ok()
        );
    }
}
