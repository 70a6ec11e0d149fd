//! Bounded retry shared by service waits and downloads.

use std::fmt::Display;
use std::thread;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; 0 is treated as 1.
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
        }
    }

    /// Poll every `interval` until `timeout` has passed.
    pub fn polling(timeout: Duration, interval: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        let polls = timeout.as_millis() / interval.as_millis();
        Self::fixed(u32::try_from(polls).unwrap_or(u32::MAX).saturating_add(1), interval)
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => self
                .delay
                .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1))),
        }
    }

    /// Run `op` until it succeeds or attempts run out; returns the last error.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn run<T, E, F>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if attempt < attempts => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        what,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying after failure"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn succeeds_on_a_later_attempt() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let mut calls = 0;
        let result: Result<u32, String> = policy.run("flaky", |attempt| {
            calls += 1;
            if attempt < 3 {
                Err(format!("attempt {attempt}"))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result, Ok(3));
        assert_eq!(calls, 3);
    }

    #[test]
    fn hard_cap_returns_last_error() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let mut calls = 0;
        let result: Result<(), String> = policy.run("down", |attempt| {
            calls += 1;
            Err(format!("attempt {attempt}"))
        });
        assert_eq!(result, Err("attempt 3".to_string()));
        assert_eq!(calls, 3);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let policy = RetryPolicy::fixed(0, Duration::ZERO);
        let mut calls = 0;
        let _: Result<(), &str> = policy.run("once", |_| {
            calls += 1;
            Err("no")
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn delays() {
        let fixed = RetryPolicy::fixed(3, Duration::from_secs(2));
        assert_eq!(fixed.delay_after(1), Duration::from_secs(2));
        assert_eq!(fixed.delay_after(2), Duration::from_secs(2));

        let exp = RetryPolicy {
            backoff: Backoff::Exponential,
            ..fixed
        };
        assert_eq!(exp.delay_after(1), Duration::from_secs(2));
        assert_eq!(exp.delay_after(3), Duration::from_secs(8));
    }

    #[test]
    fn polling_covers_the_timeout() {
        let policy = RetryPolicy::polling(Duration::from_secs(30), Duration::from_millis(500));
        assert_eq!(policy.max_attempts, 61);
        assert_eq!(policy.delay, Duration::from_millis(500));
    }
}
