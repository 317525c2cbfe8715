use rand::Rng;
use std::{future::Future, time::Duration};
use tokio::time::Instant;
use tracing::debug;

/// Exponential backoff bounded by a deadline over the whole operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    initial: Duration,
    multiplier: f64,
    jitter: f64,
    deadline: Duration,
}

/// The operation kept failing until the policy deadline.
#[derive(Debug)]
pub struct RetryError<E> {
    pub attempts: u32,
    pub elapsed: Duration,
    pub last: E,
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gave up after {} attempts in {}: {}",
            self.attempts,
            humantime::format_duration(self.elapsed),
            self.last
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.last)
    }
}

impl RetryPolicy {
    /// Start with `initial` delay, doubling on every attempt, until `deadline` has elapsed.
    pub fn new(initial: Duration, deadline: Duration) -> Self {
        Self {
            initial,
            multiplier: 2.0,
            jitter: 0.0,
            deadline,
        }
    }
    /// Grow the delay by `multiplier` after every attempt.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }
    /// Randomize each delay by up to +/- `jitter` of its value.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }
    /// The policy used to format a freshly attached device.
    pub fn format() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(30)).with_jitter(0.1)
    }
    /// The policy used to wait for an iSCSI device to show up.
    pub fn device(timeout: Duration) -> Self {
        Self::new(Duration::from_secs(1), timeout)
    }
    /// The deadline over all attempts.
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter ..= self.jitter);
        delay.mul_f64(factor)
    }

    /// Run `operation` until it succeeds, or until the next attempt would start past the
    /// deadline. The operation receives the attempt number, starting at 1.
    pub async fn retry<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let mut delay = self.initial;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let last = match operation(attempts).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let elapsed = start.elapsed();
            let sleep = self.jittered(delay);
            if elapsed + sleep > self.deadline {
                return Err(RetryError {
                    attempts,
                    elapsed,
                    last,
                });
            }
            debug!(attempts, error = %last, "Retrying in {:?}", sleep);
            tokio::time::sleep(sleep).await;
            delay = delay.mul_f64(self.multiplier);
        }
    }
}
