//! Middleware chain: ordered onion composition around the terminal call.
//!
//! The first-registered middleware's pre-logic runs first and its post-logic
//! runs last; the terminal carrier call sits innermost. Each middleware gets
//! the shared read-only [`RequestContext`] and a [`Next`] continuation; it may
//! short-circuit by not invoking `next` at all (cache hit, open circuit).
//! With an empty chain the terminal call runs directly.
//!
//! Each middleware instance exclusively owns its keyed state (circuits,
//! limiter budgets, cache entries); nothing is shared across middlewares.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::breaker::CircuitBreaker;
use crate::cache::ResultCache;
use crate::error::TrackingError;
use crate::limiter::KeyedRateLimiter;
use crate::model::{RequestContext, TrackingResult};
use crate::retry::RetryPolicy;

/// The innermost call: dispatches the context to its carrier adapter.
pub type Terminal =
    dyn Fn(&RequestContext) -> BoxFuture<'static, Result<TrackingResult, TrackingError>>
        + Send
        + Sync;

/// One layer of the onion.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Handle the request, usually by delegating to `next.run(ctx)`.
    async fn handle(
        &self,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<TrackingResult, TrackingError>;
}

/// Continuation invoking the remainder of the chain (or the terminal call).
///
/// `Copy`, so retrying middlewares can re-run the remainder.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Middleware>],
    terminal: &'a Terminal,
}

impl<'a> Next<'a> {
    /// Entry point: compose `middlewares` around `terminal`.
    pub fn chain(middlewares: &'a [Arc<dyn Middleware>], terminal: &'a Terminal) -> Self {
        Self { rest: middlewares, terminal }
    }

    /// Invoke the remainder of the chain.
    pub async fn run(self, ctx: &RequestContext) -> Result<TrackingResult, TrackingError> {
        match self.rest.split_first() {
            Some((head, tail)) => {
                head.handle(ctx, Next { rest: tail, terminal: self.terminal }).await
            }
            None => (self.terminal)(ctx).await,
        }
    }
}

/// Pass-through observability layer: spans the dispatch and logs the outcome.
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(
        &self,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<TrackingResult, TrackingError> {
        let started = Instant::now();
        tracing::info!(
            courier = %ctx.courier_code,
            tracking_number = %ctx.tracking_number,
            "dispatching tracking request"
        );
        let outcome = next.run(ctx).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(result) => tracing::info!(
                courier = %ctx.courier_code,
                tracking_number = %ctx.tracking_number,
                events = result.events.len(),
                elapsed_ms,
                "tracking request succeeded"
            ),
            Err(err) => tracing::warn!(
                courier = %ctx.courier_code,
                tracking_number = %ctx.tracking_number,
                elapsed_ms,
                error = %err,
                "tracking request failed"
            ),
        }
        outcome
    }
}

/// Short-circuits on a fresh cached result; populates the cache only from
/// downstream successes (failures are rethrown, never cached).
#[derive(Debug)]
pub struct CacheMiddleware {
    cache: ResultCache,
}

impl CacheMiddleware {
    /// Middleware owning `cache`.
    pub fn new(cache: ResultCache) -> Self {
        Self { cache }
    }

    /// Read access for tests and diagnostics.
    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }
}

#[async_trait]
impl Middleware for CacheMiddleware {
    async fn handle(
        &self,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<TrackingResult, TrackingError> {
        let key = ResultCache::key_for(ctx);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(%key, "serving tracking result from cache");
            return Ok(hit);
        }
        let result = next.run(ctx).await?;
        self.cache.insert(key, result.clone());
        Ok(result)
    }
}

/// Gates the remainder of the chain behind the courier's circuit.
#[derive(Debug)]
pub struct CircuitBreakerMiddleware {
    breaker: CircuitBreaker,
}

impl CircuitBreakerMiddleware {
    /// Middleware owning `breaker`.
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }

    /// Breaker handle for tests and operational inspection.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    async fn handle(
        &self,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<TrackingResult, TrackingError> {
        self.breaker.execute(&ctx.courier_code, || next.run(ctx)).await
    }
}

/// Re-runs the remainder of the chain on classified-transient failures.
#[derive(Debug)]
pub struct RetryMiddleware {
    policy: RetryPolicy,
}

impl RetryMiddleware {
    /// Middleware owning `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(
        &self,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<TrackingResult, TrackingError> {
        self.policy.execute(|| next.run(ctx)).await
    }
}

/// Defers the remainder of the chain until the courier's budget allows it.
#[derive(Debug)]
pub struct RateLimitMiddleware {
    limiter: KeyedRateLimiter,
}

impl RateLimitMiddleware {
    /// Middleware owning `limiter`.
    pub fn new(limiter: KeyedRateLimiter) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    async fn handle(
        &self,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<TrackingResult, TrackingError> {
        self.limiter.run(&ctx.courier_code, || next.run(ctx)).await
    }
}
