//! Bounded retry with uniform random backoff.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    attempts: u32,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    /// `attempts` counts the first try; zero is treated as one.
    pub fn new(attempts: u32, min_backoff: Duration, max_backoff: Duration) -> Self {
        let (min_backoff, max_backoff) = if min_backoff <= max_backoff {
            (min_backoff, max_backoff)
        } else {
            (max_backoff, min_backoff)
        };
        Self {
            attempts: attempts.max(1),
            min_backoff,
            max_backoff,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Uniformly drawn wait between two attempts.
    pub fn backoff(&self) -> Duration {
        let lo = self.min_backoff.as_millis() as u64;
        let hi = self.max_backoff.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }

    /// Run `op` until it succeeds or the attempts are used up. The last
    /// error is returned on exhaustion.
    pub async fn run<T, F>(&self, what: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> anyhow::Result<T>,
    {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.attempts => return Err(e),
                Err(e) => {
                    let wait = self.backoff();
                    warn!(
                        attempt,
                        max_attempts = self.attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying",
                        what
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}
