//! Bounded retry with exponential backoff and jitter for storage calls.
//!
//! Only [`StoreError::Transient`] is retried. Everything else, including
//! business outcomes like insufficient balance or a claimed idempotency key,
//! goes straight back to the caller. Wrap an operation in a policy only when
//! re-running it cannot apply it twice: it carries an idempotency key, or
//! the store enforces uniqueness for it (refunds).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use creditline_store::StoreError;

/// Maps a capped backoff delay to the delay actually slept.
pub type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// Retry policy for transient storage errors.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay between retries (backoff is capped here).
    pub max_delay: Duration,
    jitter: JitterFn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(50), Duration::from_secs(1))
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

/// "Equal jitter": half the delay fixed, half uniformly random.
fn equal_jitter(delay: Duration) -> Duration {
    let half = u64::try_from(delay.as_millis() / 2).unwrap_or(u64::MAX);
    let extra = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half.saturating_add(extra))
}

impl RetryPolicy {
    /// A policy with randomized jitter. `max_attempts` is at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: Arc::new(equal_jitter),
        }
    }

    /// A single attempt, no retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Replace the jitter function (tests use the identity).
    #[must_use]
    pub fn with_jitter(mut self, jitter: impl Fn(Duration) -> Duration + Send + Sync + 'static) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    /// Delay before retry number `retry` (1-based), after jitter.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        (self.jitter)(backoff)
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts.
    ///
    /// # Errors
    ///
    /// Returns the first non-transient error, or the last transient error
    /// once attempts are exhausted.
    pub async fn run<T>(
        &self,
        operation: &'static str,
        mut op: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Transient storage error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
