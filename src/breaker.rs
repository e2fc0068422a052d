//! Per-courier circuit breaker.
//!
//! One breaker instance owns a map of per-key circuits, so one carrier
//! melting down never gates calls to another. Each circuit is a lock-free
//! record (state byte, consecutive-failure count, last-failure instant) whose
//! transitions happen via compare-and-swap; the OPEN→HALF_OPEN transition is
//! evaluated lazily inside the next call for that key, never by a timer.
//!
//! Concurrent failures may both observe a pre-threshold count and both push it
//! past the limit; the race is benign, the circuit only trips earlier.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::error::{SetupError, TrackingError};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Observable state of one circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast without touching the carrier.
    Open,
    /// One probe call is testing whether the carrier recovered.
    HalfOpen,
}

fn state_from_u8(raw: u8) -> CircuitState {
    match raw {
        STATE_OPEN => CircuitState::Open,
        STATE_HALF_OPEN => CircuitState::HalfOpen,
        _ => CircuitState::Closed,
    }
}

/// Validated breaker settings, shared by every key.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    reset_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Validate and build: `failure_threshold` and `reset_timeout` must both
    /// be non-zero.
    pub fn new(failure_threshold: usize, reset_timeout: Duration) -> Result<Self, SetupError> {
        if failure_threshold == 0 {
            return Err(SetupError::InvalidFailureThreshold(failure_threshold));
        }
        if reset_timeout.is_zero() {
            return Err(SetupError::InvalidResetTimeout(reset_timeout));
        }
        Ok(Self { failure_threshold, reset_timeout })
    }

    /// Consecutive failures required to trip a circuit.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// How long a circuit stays open before the next call may probe.
    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug)]
struct CircuitRecord {
    state: AtomicU8,
    failure_count: AtomicUsize,
    last_failure_millis: AtomicU64,
}

impl CircuitRecord {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failure_count: AtomicUsize::new(0),
            last_failure_millis: AtomicU64::new(0),
        }
    }
}

/// Keyed three-state failure gate. Clones share the same circuits.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    circuits: Arc<Mutex<HashMap<String, Arc<CircuitRecord>>>>,
}

impl CircuitBreaker {
    /// Breaker with validated settings.
    pub fn new(failure_threshold: usize, reset_timeout: Duration) -> Result<Self, SetupError> {
        Ok(Self::with_config(CircuitBreakerConfig::new(failure_threshold, reset_timeout)?))
    }

    /// Breaker from a pre-validated config.
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            clock: Arc::new(MonotonicClock::default()),
            circuits: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Override the clock (deterministic recovery timing in tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Current state of a key's circuit, if that key has been seen.
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        let circuits = self.circuits.lock().expect("circuit map poisoned");
        circuits.get(key).map(|c| state_from_u8(c.state.load(Ordering::Acquire)))
    }

    /// Force a key's circuit back to closed, clearing its failure count.
    pub fn reset(&self, key: &str) {
        let circuits = self.circuits.lock().expect("circuit map poisoned");
        if let Some(circuit) = circuits.get(key) {
            circuit.state.store(STATE_CLOSED, Ordering::Release);
            circuit.failure_count.store(0, Ordering::Release);
            circuit.last_failure_millis.store(0, Ordering::Release);
        }
    }

    fn circuit_for(&self, key: &str) -> Arc<CircuitRecord> {
        let mut circuits = self.circuits.lock().expect("circuit map poisoned");
        circuits.entry(key.to_string()).or_insert_with(|| Arc::new(CircuitRecord::new())).clone()
    }

    /// Run `operation` under the circuit for `key`.
    ///
    /// Open circuits reject with [`TrackingError::CircuitOpen`] until the
    /// reset timeout has elapsed past the last failure; the first call after
    /// that wins a CAS into half-open and becomes the probe. A successful
    /// probe closes the circuit; a failed probe reopens it. While a probe is
    /// in flight, other calls for the same key are rejected.
    pub async fn execute<T, Fut, Op>(&self, key: &str, operation: Op) -> Result<T, TrackingError>
    where
        T: Send,
        Fut: Future<Output = Result<T, TrackingError>> + Send,
        Op: FnOnce() -> Fut + Send,
    {
        let circuit = self.circuit_for(key);

        loop {
            match state_from_u8(circuit.state.load(Ordering::Acquire)) {
                CircuitState::Closed => break,
                CircuitState::HalfOpen => {
                    // A probe is already in flight for this key.
                    return Err(self.open_error(&circuit));
                }
                CircuitState::Open => {
                    let last_failure = circuit.last_failure_millis.load(Ordering::Acquire);
                    let elapsed = self.clock.now_millis().saturating_sub(last_failure);
                    if elapsed < self.config.reset_timeout.as_millis() as u64 {
                        return Err(self.open_error(&circuit));
                    }
                    match circuit.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            tracing::info!(courier = key, "circuit half-open, probing");
                            break;
                        }
                        // Lost the race; re-read and decide again.
                        Err(_) => continue,
                    }
                }
            }
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.on_success(key, &circuit),
            Err(_) => self.on_failure(key, &circuit),
        }
        result
    }

    fn open_error(&self, circuit: &CircuitRecord) -> TrackingError {
        let last_failure = circuit.last_failure_millis.load(Ordering::Acquire);
        let elapsed = self.clock.now_millis().saturating_sub(last_failure);
        TrackingError::CircuitOpen {
            failure_count: circuit.failure_count.load(Ordering::Acquire),
            open_for: Duration::from_millis(elapsed),
        }
    }

    fn on_success(&self, key: &str, circuit: &CircuitRecord) {
        match state_from_u8(circuit.state.load(Ordering::Acquire)) {
            CircuitState::HalfOpen => {
                if circuit
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    circuit.failure_count.store(0, Ordering::Release);
                    circuit.last_failure_millis.store(0, Ordering::Release);
                    tracing::info!(courier = key, "probe succeeded, circuit closed");
                }
            }
            CircuitState::Closed => {
                // Only consecutive failures count toward the threshold.
                circuit.failure_count.store(0, Ordering::Release);
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, key: &str, circuit: &CircuitRecord) {
        let failures = circuit.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        circuit.last_failure_millis.store(self.clock.now_millis(), Ordering::Release);

        match state_from_u8(circuit.state.load(Ordering::Acquire)) {
            CircuitState::HalfOpen => {
                if circuit
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    tracing::warn!(courier = key, failures, "probe failed, circuit reopened");
                }
            }
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold
                    && circuit
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    tracing::error!(
                        courier = key,
                        failures,
                        threshold = self.config.failure_threshold,
                        "failure threshold reached, circuit opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }
}
