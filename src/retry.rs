//! Retry Policies
//!
//! Capped exponential back-off for calls that may fail transiently. One
//! policy covers interactive operations (fail fast), another covers
//! init-time operations that must survive a rolling restart of the monitor.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{Error, Result};

/// A retry policy as a plain value
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// First delay between attempts
    pub base_delay: Duration,
    /// Ceiling for the delay growth
    pub max_delay: Duration,
    /// Give up after this many attempts (0 = unbounded)
    pub max_attempts: u32,
    /// Give up once this much wall time has elapsed
    pub max_total: Duration,
    /// Fraction of the delay randomized away (0.0 - 1.0)
    pub jitter: f64,
}

impl RetryPolicy {
    /// Short policy for interactive calls: fail within a couple of ticks
    pub fn interactive() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            max_attempts: 5,
            max_total: Duration::from_secs(15),
            jitter: 0.2,
        }
    }

    /// Long policy for keeper-to-monitor calls: retry for up to two minutes
    pub fn monitor_calls() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 0,
            max_total: Duration::from_secs(120),
            jitter: 0.3,
        }
    }

    /// Delay before the given attempt (first attempt is 0, no delay)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt - 1))
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return exp;
        }
        let spread = exp.as_millis() as f64 * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let millis = (exp.as_millis() as f64 + offset).max(0.0) as u64;
        Duration::from_millis(millis)
    }

    /// Whether another attempt is allowed
    pub fn allows(&self, attempt: u32, started: Instant) -> bool {
        if self.max_attempts > 0 && attempt >= self.max_attempts {
            return false;
        }
        started.elapsed() < self.max_total
    }

    /// Run an async operation under this policy, retrying retryable errors
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            let delay = self.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.allows(attempt + 1, started) => {
                    tracing::debug!("attempt {} failed, retrying: {}", attempt + 1, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Restart-failure accounting for the local PostgreSQL: too many failed
/// starts inside the window means the instance is beyond flapping
#[derive(Debug)]
pub struct RestartTracker {
    window: Duration,
    max_retries: u32,
    failures: Vec<Instant>,
}

impl RestartTracker {
    pub fn new(window: Duration, max_retries: u32) -> Self {
        Self {
            window,
            max_retries,
            failures: Vec::new(),
        }
    }

    /// Record a failed restart; returns false once the budget is exhausted
    pub fn record_failure(&mut self) -> bool {
        let now = Instant::now();
        self.failures.push(now);
        self.failures
            .retain(|t| now.duration_since(*t) < self.window);
        (self.failures.len() as u32) <= self.max_retries
    }

    /// Clear the failure history after a successful start
    pub fn record_success(&mut self) {
        self.failures.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_growth_is_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: 0,
            max_total: Duration::from_secs(60),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            max_attempts: 0,
            max_total: Duration::from_secs(60),
            jitter: 0.5,
        };
        for _ in 0..100 {
            let d = policy.delay_for_attempt(4); // 800ms nominal
            assert!(d >= Duration::from_millis(400));
            assert!(d <= Duration::from_millis(1200));
        }
    }

    #[tokio::test]
    async fn test_run_retries_transient_errors() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_attempts: 5,
            max_total: Duration::from_secs(5),
            jitter: 0.0,
        };
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<u32> = policy
            .run(|| {
                let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::Network("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_on_permanent_errors() {
        let policy = RetryPolicy::interactive();
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<u32> = policy
            .run(|| {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(Error::Config("bad".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_restart_tracker_budget() {
        let mut tracker = RestartTracker::new(Duration::from_secs(60), 2);
        assert!(tracker.record_failure());
        assert!(tracker.record_failure());
        assert!(!tracker.record_failure());
        tracker.record_success();
        assert!(tracker.record_failure());
    }
}
