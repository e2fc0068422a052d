//! Per-courier request pacing.
//!
//! Each key gets an independent budget: a cap on concurrent in-flight calls
//! and a minimum spacing between call starts. Both queues are FIFO (tokio's
//! semaphore and mutex hand out permits in arrival order), so same-key calls
//! are released in submission order while different keys never block each
//! other. The limiter imposes no queue cap and no timeout of its own.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;

use crate::error::SetupError;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Budget for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Maximum concurrent in-flight calls for the key.
    pub max_concurrent: usize,
    /// Minimum spacing between call starts for the key.
    pub min_interval: Duration,
}

impl RateLimitSettings {
    /// Validated settings.
    pub fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        Self { max_concurrent, min_interval }
    }
}

impl Default for RateLimitSettings {
    /// Conservative fallback for keys with no published quota: two in flight,
    /// four starts per second.
    fn default() -> Self {
        Self { max_concurrent: 2, min_interval: Duration::from_millis(250) }
    }
}

#[derive(Debug)]
struct KeyState {
    semaphore: Semaphore,
    // Earliest instant the next call for this key may start.
    next_start: tokio::sync::Mutex<Option<Instant>>,
    min_interval: Duration,
}

/// Keyed concurrency/interval throttle. Clones share the same key states.
#[derive(Debug, Clone)]
pub struct KeyedRateLimiter {
    fallback: RateLimitSettings,
    overrides: Arc<HashMap<String, RateLimitSettings>>,
    sleeper: Arc<dyn Sleeper>,
    states: Arc<Mutex<HashMap<String, Arc<KeyState>>>>,
}

impl KeyedRateLimiter {
    /// Limiter with the conservative default budget for every key.
    pub fn new() -> Self {
        Self::with_settings(RateLimitSettings::default(), HashMap::new())
            .unwrap_or_else(|_| unreachable!("default settings are valid"))
    }

    /// Limiter with a fallback budget plus per-key overrides.
    pub fn with_settings(
        fallback: RateLimitSettings,
        overrides: HashMap<String, RateLimitSettings>,
    ) -> Result<Self, SetupError> {
        if fallback.max_concurrent == 0 {
            return Err(SetupError::InvalidConcurrency {
                key: "<default>".into(),
                provided: 0,
            });
        }
        for (key, settings) in &overrides {
            if settings.max_concurrent == 0 {
                return Err(SetupError::InvalidConcurrency { key: key.clone(), provided: 0 });
            }
        }
        Ok(Self {
            fallback,
            overrides: Arc::new(overrides),
            sleeper: Arc::new(TokioSleeper),
            states: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Inject a sleeper so pacing waits can be observed in tests.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// The budget that applies to `key`.
    pub fn settings_for(&self, key: &str) -> RateLimitSettings {
        self.overrides.get(key).copied().unwrap_or(self.fallback)
    }

    fn state_for(&self, key: &str) -> Arc<KeyState> {
        let settings = self.settings_for(key);
        let mut states = self.states.lock().expect("limiter key map poisoned");
        states
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(KeyState {
                    semaphore: Semaphore::new(settings.max_concurrent),
                    next_start: tokio::sync::Mutex::new(None),
                    min_interval: settings.min_interval,
                })
            })
            .clone()
    }

    /// Run `operation` once `key`'s budget allows, returning its output
    /// unchanged. Callers may wait arbitrarily long; timeouts belong to the
    /// operation itself.
    pub async fn run<T, Fut, Op>(&self, key: &str, operation: Op) -> T
    where
        Fut: std::future::Future<Output = T> + Send,
        Op: FnOnce() -> Fut + Send,
        T: Send,
    {
        let state = self.state_for(key);
        let _permit =
            state.semaphore.acquire().await.expect("limiter semaphore is never closed");

        // Claim the next start slot under the fair mutex, then wait outside
        // it so later callers can claim their (later) slots concurrently.
        let wait = {
            let mut next_start = state.next_start.lock().await;
            let now = Instant::now();
            let start = match *next_start {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            *next_start = Some(start + state.min_interval);
            start.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            tracing::debug!(key, wait_ms = wait.as_millis() as u64, "pacing carrier call");
            self.sleeper.sleep(wait).await;
        }

        operation().await
    }
}

impl Default for KeyedRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
