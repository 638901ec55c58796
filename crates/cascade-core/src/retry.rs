//! Bounded retry with a fixed delay, and the clock it sleeps on
//!
//! One policy type is shared by the post-checkout hook, snapshot polling and
//! tag discovery. Tests inject a [`Clock`] that records sleeps instead of
//! blocking.

use chrono::{DateTime, Local};
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, warn};

/// Source of the current time and of blocking sleeps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `std::thread::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Fixed attempt count, fixed delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// No waiting, a single attempt
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds or the attempts run out.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned
    /// together with the number of attempts made.
    pub fn run<T, E, F>(&self, clock: &dyn Clock, what: &str, mut op: F) -> Result<T, (E, u32)>
    where
        E: Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    warn!(attempt, attempts, "{what} failed, giving up: {e}");
                    return Err((e, attempt));
                }
                Err(e) => {
                    warn!(
                        attempt,
                        attempts,
                        delay_secs = self.delay.as_secs_f64(),
                        "{what} failed, retrying: {e}"
                    );
                    clock.sleep(self.delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Check `ready` up to `max_attempts` times, sleeping after each miss.
    ///
    /// Returns whether the condition was seen to hold.
    pub fn poll<F>(&self, clock: &dyn Clock, what: &str, mut ready: F) -> bool
    where
        F: FnMut() -> bool,
    {
        for attempt in 1..=self.max_attempts.max(1) {
            if ready() {
                debug!(attempt, "{what}: ready");
                return true;
            }
            debug!(
                attempt,
                attempts = self.max_attempts,
                delay_secs = self.delay.as_secs_f64(),
                "{what}: not ready, waiting"
            );
            clock.sleep(self.delay);
        }
        false
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingClock;
    use super::*;

    #[test]
    fn test_default_policy() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 2);
        assert_eq!(p.delay, Duration::from_secs(5));
    }

    #[test]
    fn test_run_succeeds_after_retry() {
        let clock = RecordingClock::default();
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let out: Result<u32, (String, u32)> = policy.run(&clock, "op", |attempt| {
            if attempt < 2 {
                Err("nope".to_string())
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(out.unwrap(), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn test_run_exhausts() {
        let clock = RecordingClock::default();
        let policy = RetryPolicy::new(2, Duration::from_secs(5));
        let mut calls = 0;
        let out: Result<(), (String, u32)> = policy.run(&clock, "op", |_| {
            calls += 1;
            Err(format!("fail {calls}"))
        });
        assert_eq!(out.unwrap_err(), ("fail 2".to_string(), 2));
        // no sleep after the final attempt
        assert_eq!(clock.sleeps().len(), 1);
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let clock = RecordingClock::default();
        let policy = RetryPolicy::new(0, Duration::from_secs(5));
        let out: Result<(), (&str, u32)> = policy.run(&clock, "op", |_| Err("x"));
        assert_eq!(out.unwrap_err().1, 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_poll() {
        let clock = RecordingClock::default();
        let policy = RetryPolicy::new(2, Duration::from_secs(5));
        assert!(!policy.poll(&clock, "wait", || false));
        assert_eq!(clock.sleeps().len(), 2);

        let clock = RecordingClock::default();
        let mut n = 0;
        assert!(policy.poll(&clock, "wait", || {
            n += 1;
            n == 2
        }));
        assert_eq!(clock.sleeps().len(), 1);
    }
}
