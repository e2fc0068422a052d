//! TTL-keyed memo for idempotent tracking lookups.
//!
//! Expiry is lazy: a read past the deadline evicts the entry and reports a
//! miss; there is no background sweep. Entries are keyed by
//! `"{courier_code}:{tracking_number}"`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::error::SetupError;
use crate::model::{RequestContext, TrackingResult};

/// Default time-to-live for cached results.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    value: TrackingResult,
    expires_at_millis: u64,
}

/// In-memory result cache owned by the cache middleware instance.
#[derive(Debug)]
pub struct ResultCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResultCache {
    /// Cache with the default 5 minute TTL.
    pub fn new() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            clock: Arc::new(MonotonicClock::default()),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cache with an explicit TTL; rejects a zero TTL.
    pub fn with_ttl(ttl: Duration) -> Result<Self, SetupError> {
        if ttl.is_zero() {
            return Err(SetupError::InvalidTtl(ttl));
        }
        Ok(Self { ttl, ..Self::new() })
    }

    /// Override the clock (deterministic expiry in tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// The key a request context caches under.
    pub fn key_for(ctx: &RequestContext) -> String {
        format!("{}:{}", ctx.courier_code, ctx.tracking_number)
    }

    /// Look up a fresh entry; a stale entry is evicted and reported as a miss.
    pub fn get(&self, key: &str) -> Option<TrackingResult> {
        let mut entries = self.entries.lock().expect("result cache poisoned");
        match entries.get(key) {
            Some(entry) if self.clock.now_millis() < entry.expires_at_millis => {
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a result, overwriting any previous entry for the key.
    pub fn insert(&self, key: impl Into<String>, value: TrackingResult) {
        let expires_at_millis =
            self.clock.now_millis().saturating_add(self.ttl.as_millis().min(u64::MAX as u128) as u64);
        let mut entries = self.entries.lock().expect("result cache poisoned");
        entries.insert(key.into(), CacheEntry { value, expires_at_millis });
    }

    /// Number of entries currently held, stale ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("result cache poisoned").len()
    }

    /// True when no entries are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new()
    }
}
