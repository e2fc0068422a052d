//! Delay abstraction so backoff and pacing waits can be observed (or skipped)
//! in tests instead of burning wall-clock time.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the pipeline waits: retry backoff and limiter pacing both go through
/// this trait.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    /// Suspend the current task for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that completes immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async {})
    }
}

/// Test sleeper that records every requested delay without waiting.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    requested: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    /// Fresh tracker with no recorded delays.
    pub fn new() -> Self {
        Self::default()
    }

    /// All delays requested so far, in order.
    pub fn requested(&self) -> Vec<Duration> {
        self.requested.lock().expect("sleeper log poisoned").clone()
    }

    /// Number of sleep calls recorded.
    pub fn count(&self) -> usize {
        self.requested.lock().expect("sleeper log poisoned").len()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.requested.lock().expect("sleeper log poisoned").push(duration);
        Box::pin(async {})
    }
}
