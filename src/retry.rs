//! Bounded retry for transient carrier failures.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Only transient failures (HTTP 429/5xx, connection loss) are retried;
//!   everything else propagates on first occurrence.
//! - Backoff before retry `n` (0-indexed) is `base * 2^n`, applied only
//!   between attempts, never before the first.
//! - When the budget is exhausted the most recent error propagates unchanged,
//!   so callers see the carrier's own failure rather than a wrapper.
//! - Waits go through [`Sleeper`], so tests assert the schedule without
//!   sleeping.
//!
//! Tracking lookups are read-only, which is what makes blind re-execution
//! safe here; no idempotency-key machinery is needed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{SetupError, TrackingError};
use crate::sleeper::{Sleeper, TokioSleeper};

/// Ceiling applied when backoff math would overflow.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

/// Exponential backoff schedule with an optional cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Doubling schedule starting at `base`.
    pub fn exponential(base: Duration) -> Self {
        Self { base, max: None }
    }

    /// Cap every delay at `max`.
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    /// Delay before retry `retry` (0-indexed: the first retry waits `base`).
    pub fn delay(&self, retry: usize) -> Duration {
        let exponent = retry.min(u32::MAX as usize) as u32;
        let multiplier = 2u128.saturating_pow(exponent);
        let nanos = self.base.as_nanos().saturating_mul(multiplier);
        let delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
        self.max.map(|m| delay.min(m)).unwrap_or(delay).min(MAX_BACKOFF)
    }
}

/// Randomization applied on top of the backoff schedule.
///
/// Defaults to `None` so the documented `base * 2^n` schedule holds exactly;
/// enable `Full` when many processes hit the same carrier and synchronized
/// retries would stampede it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Use the exact backoff delay.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// Uniform in `[delay/2, delay]`, keeping a floor.
    Equal,
}

impl Jitter {
    /// Randomize a delay according to the strategy.
    pub fn apply(&self, delay: Duration) -> Duration {
        let millis = delay.as_millis().min(u64::MAX as u128) as u64;
        if millis == 0 {
            return delay;
        }
        let mut rng = rand::rng();
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=millis)),
            Jitter::Equal => Duration::from_millis(rng.random_range(millis / 2..=millis)),
        }
    }
}

/// Retry policy: attempt budget, backoff, jitter, classification, sleeper.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    classify: Arc<dyn Fn(&TrackingError) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("classify", &"<predicate>")
            .finish()
    }
}

impl RetryPolicy {
    /// Builder with defaults: 3 attempts, 500 ms exponential backoff, no
    /// jitter, [`TrackingError::is_transient`] classification.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Execute `operation`, repeating classified-transient failures until the
    /// attempt budget runs out.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, TrackingError>
    where
        T: Send,
        Fut: Future<Output = Result<T, TrackingError>> + Send,
        Op: FnMut() -> Fut + Send,
    {
        let mut last_err: Option<TrackingError> = None;

        for attempt in 0..self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if !(self.classify)(&err) {
                        return Err(err);
                    }
                    if attempt + 1 >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.jitter.apply(self.backoff.delay(attempt));
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, backing off before retry"
                    );
                    last_err = Some(err);
                    self.sleeper.sleep(delay).await;
                }
            }
        }

        // The loop always returns from its final iteration; this line is
        // reachable only with max_attempts == 0, which the builder rejects.
        match last_err {
            Some(err) => Err(err),
            None => Err(TrackingError::Config { reason: "retry budget was zero".into() }),
        }
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    classify: Arc<dyn Fn(&TrackingError) -> bool + Send + Sync>,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryPolicyBuilder {
    /// Builder with tracking-pipeline defaults.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_millis(500)),
            jitter: Jitter::None,
            classify: Arc::new(TrackingError::is_transient),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Backoff schedule between attempts.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Jitter strategy applied to each delay.
    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the retryability predicate.
    pub fn classify<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TrackingError) -> bool + Send + Sync + 'static,
    {
        self.classify = Arc::new(predicate);
        self
    }

    /// Inject a sleeper (tests use `InstantSleeper`/`TrackingSleeper`).
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<RetryPolicy, SetupError> {
        if self.max_attempts == 0 {
            return Err(SetupError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            classify: self.classify,
            sleeper: self.sleeper,
        })
    }
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}
