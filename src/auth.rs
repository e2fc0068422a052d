//! OAuth token lifecycle: cache, single-flight refresh, reactive re-auth.
//!
//! Each adapter owns one [`TokenManager`]. A cached token is served while it
//! is outside the safety buffer of its expiry; otherwise callers collapse
//! onto a single in-flight refresh (late joiners await the same shared
//! future, so N concurrent `get_token` calls produce exactly one upstream
//! request). The in-flight handle is cleared when the refresh completes,
//! success or failure, so a failed refresh never poisons the next attempt —
//! it only fails the callers that were waiting on it.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::clock::{Clock, MonotonicClock};
use crate::error::TrackingError;

/// Default safety buffer subtracted from a token's lifetime.
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(30);

/// A token as issued by a carrier's token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// The bearer token to attach to data calls.
    pub access_token: String,
    /// Carrier-declared lifetime.
    pub expires_in: Duration,
}

/// The carrier's token endpoint, supplied per adapter.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// Exchange credentials for a fresh token.
    async fn request_token(&self) -> Result<IssuedToken, TrackingError>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at_millis: u64,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<String, TrackingError>>>;

struct Inner {
    endpoint: Arc<dyn TokenEndpoint>,
    buffer: Duration,
    clock: Arc<dyn Clock>,
    cached: Mutex<Option<CachedToken>>,
    in_flight: Mutex<Option<SharedRefresh>>,
}

/// Per-adapter token cache with single-flight refresh.
///
/// Clones share the same cache and in-flight handle.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager").field("buffer", &self.inner.buffer).finish()
    }
}

impl TokenManager {
    /// Manager over an endpoint with the default 30 s safety buffer.
    pub fn new(endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self::with_buffer(endpoint, DEFAULT_EXPIRY_BUFFER)
    }

    /// Manager with an explicit safety buffer.
    pub fn with_buffer(endpoint: Arc<dyn TokenEndpoint>, buffer: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                buffer,
                clock: Arc::new(MonotonicClock::default()),
                cached: Mutex::new(None),
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Override the clock (deterministic expiry in tests).
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        // Rebuild the inner so clones made after this point share the new clock.
        Self {
            inner: Arc::new(Inner {
                endpoint: self.inner.endpoint.clone(),
                buffer: self.inner.buffer,
                clock: Arc::new(clock),
                cached: Mutex::new(None),
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// A usable token: cached when fresh, otherwise refreshed upstream with
    /// concurrent callers collapsed into one request.
    pub async fn get_token(&self) -> Result<String, TrackingError> {
        if let Some(token) = self.fresh_cached() {
            return Ok(token);
        }

        let refresh = {
            let mut slot = self.inner.in_flight.lock().expect("token refresh slot poisoned");
            // Re-check under the slot lock: a refresh may have landed between
            // the fast path and here.
            if let Some(token) = self.fresh_cached() {
                return Ok(token);
            }
            match slot.as_ref() {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let refresh = Self::begin_refresh(self.inner.clone());
                    *slot = Some(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await
    }

    /// Drop the cached token; the next `get_token` refreshes.
    pub fn invalidate(&self) {
        self.inner.cached.lock().expect("token cache poisoned").take();
    }

    fn fresh_cached(&self) -> Option<String> {
        let cached = self.inner.cached.lock().expect("token cache poisoned");
        cached.as_ref().and_then(|entry| {
            if self.inner.clock.now_millis() < entry.expires_at_millis {
                Some(entry.token.clone())
            } else {
                None
            }
        })
    }

    fn begin_refresh(inner: Arc<Inner>) -> SharedRefresh {
        async move {
            tracing::debug!("refreshing carrier access token");
            let outcome = match inner.endpoint.request_token().await {
                Ok(issued) => {
                    let lifetime = issued.expires_in.saturating_sub(inner.buffer);
                    let expires_at_millis = inner
                        .clock
                        .now_millis()
                        .saturating_add(lifetime.as_millis().min(u64::MAX as u128) as u64);
                    let mut cached = inner.cached.lock().expect("token cache poisoned");
                    *cached = Some(CachedToken {
                        token: issued.access_token.clone(),
                        expires_at_millis,
                    });
                    Ok(issued.access_token)
                }
                Err(err) if err.is_auth() => Err(err),
                Err(err) => Err(TrackingError::Auth {
                    reason: format!("token refresh failed: {}", err),
                }),
            };
            // Clear the handle whatever happened, so the next caller starts
            // a fresh refresh instead of joining a finished one.
            inner.in_flight.lock().expect("token refresh slot poisoned").take();
            outcome
        }
        .boxed()
        .shared()
    }
}

/// Run a data call with a managed token, reacting to one 401.
///
/// On [`TrackingError::AuthExpired`] the cached token is invalidated and the
/// call repeated exactly once with a freshly obtained token; a second 401 is
/// reported as a terminal [`TrackingError::Auth`].
pub async fn call_with_auth<T, Fut, Op>(
    manager: &TokenManager,
    mut operation: Op,
) -> Result<T, TrackingError>
where
    Fut: Future<Output = Result<T, TrackingError>>,
    Op: FnMut(String) -> Fut,
{
    let token = manager.get_token().await?;
    match operation(token).await {
        Err(err) if err.is_auth_expired() => {
            tracing::warn!("carrier rejected cached token, re-authenticating once");
            manager.invalidate();
            let token = manager.get_token().await?;
            match operation(token).await {
                Err(err) if err.is_auth_expired() => Err(TrackingError::Auth {
                    reason: "carrier rejected a freshly issued token".into(),
                }),
                outcome => outcome,
            }
        }
        outcome => outcome,
    }
}
