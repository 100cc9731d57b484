//! Per-address connection rate limiter.
//!
//! Each source address gets a counter for the current window. Windows are
//! rolled over lazily from [`RateLimiter::check`], at most once per window:
//! an address whose count in the closed window exceeded `max_count` is
//! blocked, and blocked addresses are evicted once their block is at least
//! `block_expire` old.
//!
//! Blocking is only evaluated at rollover, so an address crossing the limit
//! mid-window keeps being admitted until the next rollover.
//! Addresses that are never blocked are never evicted.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::config::LimiterConfig;

/// Tracked state for one source address.
#[derive(Debug, Clone)]
struct AddrRecord {
    /// Admissions in the current window
    counter: u32,
    blocked: bool,
    blocked_at: Option<Instant>,
}

impl AddrRecord {
    fn new() -> Self {
        Self {
            counter: 0,
            blocked: false,
            blocked_at: None,
        }
    }
}

#[derive(Debug)]
struct LimiterInner {
    addrs: HashMap<IpAddr, AddrRecord>,
    last_update: Instant,
}

/// Sliding-window blocker shared by every accept path.
#[derive(Debug)]
pub struct RateLimiter {
    max_count: u32,
    window: Duration,
    block_expire: Duration,
    inner: Mutex<LimiterInner>,
}

impl RateLimiter {
    pub fn new(max_count: u32, window: Duration, block_expire: Duration) -> Self {
        Self::new_at(max_count, window, block_expire, Instant::now())
    }

    /// Create a limiter whose first window opens at `now`.
    pub fn new_at(max_count: u32, window: Duration, block_expire: Duration, now: Instant) -> Self {
        Self {
            max_count,
            window,
            block_expire,
            inner: Mutex::new(LimiterInner {
                addrs: HashMap::new(),
                last_update: now,
            }),
        }
    }

    pub fn from_config(config: &LimiterConfig) -> Self {
        Self::new(config.max_count, config.window, config.block_expire)
    }

    /// Admit or reject a request from `ip`.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    /// [`check`](Self::check) against an explicit clock reading.
    #[instrument(level = "trace", skip(self, now))]
    pub fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut inner = self.lock();
        self.update(&mut inner, now);

        let record = inner.addrs.entry(ip).or_insert_with(AddrRecord::new);
        if record.blocked {
            return false;
        }

        record.counter = record.counter.saturating_add(1);
        true
    }

    /// Whether `ip` is currently blocked.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.lock().addrs.get(&ip).is_some_and(|r| r.blocked)
    }

    /// Number of addresses currently tracked.
    pub fn tracked(&self) -> usize {
        self.lock().addrs.len()
    }

    /// Roll the window over if it has closed.
    fn update(&self, inner: &mut LimiterInner, now: Instant) {
        if now.saturating_duration_since(inner.last_update) < self.window {
            return;
        }

        let max_count = self.max_count;
        let block_expire = self.block_expire;

        inner.addrs.retain(|ip, record| {
            if record.counter > max_count && !record.blocked {
                warn!(%ip, count = record.counter, "Address exceeded rate limit, blocking");
                record.blocked = true;
                record.blocked_at = Some(now);
            }
            record.counter = 0;

            match (record.blocked, record.blocked_at) {
                (true, Some(at)) if now.saturating_duration_since(at) >= block_expire => {
                    debug!(%ip, "Block expired, forgetting address");
                    false
                }
                _ => true,
            }
        });

        inner.last_update = now;
    }

    fn lock(&self) -> MutexGuard<'_, LimiterInner> {
        // The inner state stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&LimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(1);
    const EXPIRE: Duration = Duration::from_secs(30);

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn burst_within_one_window_is_admitted() {
        let start = Instant::now();
        let limiter = RateLimiter::new_at(5, WINDOW, EXPIRE, start);

        for i in 0..6 {
            let at = start + Duration::from_millis(100 * i);
            assert!(limiter.check_at(ip(1), at), "check {i} rejected");
        }
        assert!(!limiter.is_blocked(ip(1)));
    }

    #[test]
    fn excess_is_blocked_at_the_next_rollover() {
        let start = Instant::now();
        let limiter = RateLimiter::new_at(5, WINDOW, EXPIRE, start);

        for _ in 0..6 {
            assert!(limiter.check_at(ip(1), start));
        }

        let next = start + WINDOW;
        assert!(!limiter.check_at(ip(1), next));
        assert!(limiter.is_blocked(ip(1)));
        assert!(limiter.check_at(ip(2), next), "other addresses unaffected");
    }

    #[test]
    fn limit_is_inclusive() {
        let start = Instant::now();
        let limiter = RateLimiter::new_at(5, WINDOW, EXPIRE, start);

        for _ in 0..5 {
            assert!(limiter.check_at(ip(1), start));
        }
        assert!(limiter.check_at(ip(1), start + WINDOW));
    }

    #[test]
    fn expired_block_is_evicted_and_address_starts_fresh() {
        let start = Instant::now();
        let limiter = RateLimiter::new_at(1, WINDOW, EXPIRE, start);

        limiter.check_at(ip(1), start);
        limiter.check_at(ip(1), start);
        let blocked_at = start + WINDOW;
        assert!(!limiter.check_at(ip(1), blocked_at));

        // Just before expiry the block holds
        let almost = blocked_at + EXPIRE - Duration::from_millis(1);
        assert!(!limiter.check_at(ip(1), almost));
        assert!(limiter.is_blocked(ip(1)));

        let expired = blocked_at + EXPIRE + WINDOW;
        assert!(limiter.check_at(ip(1), expired));
        assert!(!limiter.is_blocked(ip(1)));
    }

    #[test]
    fn idle_unblocked_addresses_are_retained() {
        let start = Instant::now();
        let limiter = RateLimiter::new_at(5, WINDOW, EXPIRE, start);

        limiter.check_at(ip(1), start);
        limiter.check_at(ip(2), start + EXPIRE * 10);
        assert_eq!(limiter.tracked(), 2);
    }

    #[test]
    fn rollover_happens_at_most_once_per_window() {
        let start = Instant::now();
        let limiter = RateLimiter::new_at(2, WINDOW, EXPIRE, start);

        // Counts accumulate across calls that land inside one window
        let mid = start + Duration::from_millis(500);
        for _ in 0..3 {
            limiter.check_at(ip(1), mid);
        }
        assert!(limiter.check_at(ip(1), start + Duration::from_millis(900)));
        assert!(!limiter.check_at(ip(1), start + WINDOW));
    }
}
