//! Failed-login throttling.
//!
//! Failures are tracked in rolling windows under two keys: the (client address, username)
//! pair with the configured threshold, and the username alone with a looser one so that
//! guesses spread over many addresses are still bounded. Once a key reaches its threshold,
//! further attempts are refused until the oldest failure leaves the window.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tracing::warn;

use crate::error::CasError;

/// The username-only bucket allows this many times the per-address threshold.
const USERNAME_THRESHOLD_FACTOR: u32 = 4;

#[derive(Debug)]
pub struct LoginThrottle {
    threshold: u32,
    window: Duration,
    failures: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl LoginThrottle {
    #[must_use]
    pub fn new(threshold: u32, window: Duration) -> Self {
        Self {
            threshold,
            window,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn keys(ip: &str, username: &str) -> [(String, u32); 2] {
        let username = username.trim().to_lowercase();
        [
            (format!("{ip}|{username}"), 1),
            (format!("*|{username}"), USERNAME_THRESHOLD_FACTOR),
        ]
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, VecDeque<Instant>>>, CasError> {
        self.failures
            .lock()
            .map_err(|_| CasError::Internal("throttle lock poisoned".to_string()))
    }

    fn prune(&self, entries: &mut VecDeque<Instant>, now: Instant) {
        while entries
            .front()
            .is_some_and(|at| now.duration_since(*at) >= self.window)
        {
            entries.pop_front();
        }
    }

    /// # Errors
    /// Returns `Throttled` when either bucket has reached its failure threshold.
    pub fn check(&self, ip: &str, username: &str) -> Result<(), CasError> {
        if self.threshold == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut failures = self.lock()?;
        for (key, factor) in Self::keys(ip, username) {
            let Some(entries) = failures.get_mut(&key) else {
                continue;
            };
            self.prune(entries, now);
            let count = entries.len();
            if count == 0 {
                failures.remove(&key);
                continue;
            }
            if count >= self.threshold.saturating_mul(factor) as usize {
                warn!(ip, username, "login throttled");
                return Err(CasError::Throttled);
            }
        }
        Ok(())
    }

    pub fn record_failure(&self, ip: &str, username: &str) {
        let now = Instant::now();
        if let Ok(mut failures) = self.lock() {
            failures.retain(|_, entries| {
                self.prune(entries, now);
                !entries.is_empty()
            });
            for (key, _) in Self::keys(ip, username) {
                failures.entry(key).or_default().push_back(now);
            }
        }
    }

    /// A successful login clears its own address bucket. The username bucket keeps
    /// counting so one known password cannot reset guesses made elsewhere.
    pub fn record_success(&self, ip: &str, username: &str) {
        if let Ok(mut failures) = self.lock() {
            let [(own, _), _] = Self::keys(ip, username);
            failures.remove(&own);
        }
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.failures.lock().map(|failures| failures.len()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_blocks_until_success() {
        let throttle = LoginThrottle::new(2, Duration::from_secs(60));
        throttle.record_failure("1.1.1.1", "casuser");
        assert!(throttle.check("1.1.1.1", "casuser").is_ok());
        throttle.record_failure("1.1.1.1", "CasUser");
        assert_eq!(
            throttle.check("1.1.1.1", "casuser"),
            Err(CasError::Throttled)
        );
        throttle.record_success("1.1.1.1", "casuser");
        assert!(throttle.check("1.1.1.1", "casuser").is_ok());
    }

    #[test]
    fn failures_leave_the_window() {
        let throttle = LoginThrottle::new(1, Duration::ZERO);
        throttle.record_failure("1.1.1.1", "casuser");
        assert!(throttle.check("1.1.1.1", "casuser").is_ok());
    }

    #[test]
    fn changing_address_does_not_reset_the_username_bucket() {
        let throttle = LoginThrottle::new(2, Duration::from_secs(60));
        for n in 0..(2 * USERNAME_THRESHOLD_FACTOR) {
            let ip = format!("10.0.0.{n}");
            assert!(throttle.check(&ip, "casuser").is_ok());
            throttle.record_failure(&ip, "casuser");
        }
        assert_eq!(
            throttle.check("192.168.1.1", "casuser"),
            Err(CasError::Throttled)
        );
        assert!(throttle.check("192.168.1.1", "other").is_ok());
    }

    #[test]
    fn stale_keys_are_dropped() {
        let throttle = LoginThrottle::new(3, Duration::ZERO);
        throttle.record_failure("1.1.1.1", "casuser");
        throttle.record_failure("2.2.2.2", "other");
        // only the latest failure's two keys survive
        assert_eq!(throttle.tracked(), 2);
        assert!(throttle.check("2.2.2.2", "other").is_ok());
        assert_eq!(throttle.tracked(), 0);
    }

    #[test]
    fn zero_threshold_disables() {
        let throttle = LoginThrottle::new(0, Duration::from_secs(60));
        throttle.record_failure("1.1.1.1", "casuser");
        assert!(throttle.check("1.1.1.1", "casuser").is_ok());
    }
}
