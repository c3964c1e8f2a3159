//! Utility functions and helpers
//!
//! Retry backoff and timestamp helpers shared by the coordination loops.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Convert a std duration to a chrono duration, saturating on overflow
pub fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Instant before which a lease acquired at that time has expired
pub fn lease_cutoff(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(chrono_duration(ttl))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of each delay randomly added or removed (0.0 disables jitter)
    pub jitter: f64,
    /// Total time after which retrying stops; `None` retries forever
    pub give_up_after: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.1,
            give_up_after: Some(Duration::from_secs(600)),
        }
    }
}

impl BackoffPolicy {
    /// Fixed spacing with no growth, no jitter and no ceiling
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
            give_up_after: None,
        }
    }

    /// Set the give-up ceiling
    pub fn with_give_up_after(mut self, give_up_after: Option<Duration>) -> Self {
        self.give_up_after = give_up_after;
        self
    }

    /// Start a new backoff sequence
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            current_attempt: 0,
            started: Instant::now(),
        }
    }
}

/// Running exponential backoff calculator
#[derive(Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    current_attempt: u32,
    started: Instant,
}

impl Backoff {
    /// Delay before the next attempt without jitter
    fn base_delay(&self) -> Duration {
        if self.current_attempt == 0 {
            return self.policy.initial_delay.min(self.policy.max_delay);
        }
        let exponential = self.policy.initial_delay.as_secs_f64()
            * self.policy.multiplier.powi(self.current_attempt as i32);
        if !exponential.is_finite() {
            return self.policy.max_delay;
        }
        Duration::from_secs_f64(exponential).min(self.policy.max_delay)
    }

    /// Get the next delay, or `None` once the give-up ceiling would be crossed
    pub fn next_delay(&mut self) -> Option<Duration> {
        let mut delay = self.base_delay();

        if self.policy.jitter > 0.0 && !delay.is_zero() {
            let spread = delay.as_secs_f64() * self.policy.jitter;
            let offset = rand::rng().random_range(-spread..=spread);
            delay = Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0));
        }

        if let Some(limit) = self.policy.give_up_after {
            if self.started.elapsed() + delay > limit {
                return None;
            }
        }

        self.current_attempt += 1;
        Some(delay)
    }

    /// Time since the sequence started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Number of delays handed out so far
    pub fn attempt(&self) -> u32 {
        self.current_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(give_up_after: Option<Duration>) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
            multiplier: 2.0,
            jitter: 0.0,
            give_up_after,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let mut backoff = no_jitter(None).start();

        let delays: Vec<u128> = (0..7)
            .map(|_| backoff.next_delay().unwrap().as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600, 3200, 5000]);
        assert_eq!(backoff.attempt(), 7);
    }

    #[test]
    fn test_fixed_backoff() {
        let mut backoff = BackoffPolicy::fixed(Duration::from_millis(100)).start();
        for _ in 0..10 {
            assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        }
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = BackoffPolicy {
            jitter: 0.1,
            ..no_jitter(None)
        };
        for _ in 0..100 {
            let delay = policy.start().next_delay().unwrap();
            assert!(delay >= Duration::from_millis(90));
            assert!(delay <= Duration::from_millis(110));
        }
    }

    #[test]
    fn test_give_up_ceiling() {
        let mut backoff = no_jitter(Some(Duration::from_millis(350))).start();

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        // 100 + 200 handed out, but no time has passed; 400 alone crosses 350
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_lease_cutoff() {
        let now = Utc::now();
        let cutoff = lease_cutoff(now, Duration::from_secs(30));
        assert_eq!((now - cutoff).num_seconds(), 30);
    }
}
