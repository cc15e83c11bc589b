use std::cmp;
use std::fmt::Display;
use std::thread;
use std::time::Duration;
use tracing::warn;

use crate::config::ReconcilerConfig;

/// Bounded linear backoff for durable writes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    attempts: u32,
    step: Duration,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, step: Duration, max: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            step,
            max,
        }
    }

    pub fn from_config(config: &ReconcilerConfig) -> Self {
        Self::new(
            config.write_attempts,
            Duration::from_millis(config.backoff_step_ms),
            Duration::from_millis(config.backoff_max_ms),
        )
    }

    /// Delay before retry number `retry` (1-based).
    fn delay_for(&self, retry: u32) -> Duration {
        cmp::min(self.step.saturating_mul(retry), self.max)
    }

    pub fn run<T, E: Display>(
        &self,
        operation: &str,
        mut op: impl FnMut() -> Result<T, E>,
    ) -> Result<T, E> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after write failure"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_linearly_then_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(50), Duration::from_millis(120));
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(2), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(120));
    }

    #[test]
    fn run_recovers_from_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::ZERO, Duration::ZERO);
        let mut calls = 0;
        let result: Result<u32, String> = policy.run("test", || {
            calls += 1;
            if calls < 3 {
                Err("busy".to_string())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn run_gives_up_after_attempts() {
        let policy = RetryPolicy::new(2, Duration::ZERO, Duration::ZERO);
        let mut calls = 0;
        let result: Result<(), String> = policy.run("test", || {
            calls += 1;
            Err("down".to_string())
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);
        let mut calls = 0;
        let _: Result<(), String> = policy.run("test", || {
            calls += 1;
            Err("down".to_string())
        });
        assert_eq!(calls, 1);
    }
}
