#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Waybill 📦
//!
//! Resilient multi-courier shipment tracking: one front door that routes a
//! tracking number to the right carrier adapter through a middleware chain
//! of caching, circuit breaking, retry, and rate limiting.
//!
//! ## Features
//!
//! - **Courier registry** with explicit codes and grammar-based detection
//!   (including the UPU S10 universal postal format)
//! - **Retry policies** with exponential backoff and optional jitter
//! - **Per-courier circuit breakers** with half-open state recovery
//! - **Per-courier rate limiting** (concurrency plus minimum call spacing)
//! - **TTL result cache** with lazy eviction
//! - **OAuth token lifecycle** with single-flight refresh and reactive
//!   re-auth on 401
//! - **Batch dispatch** where one item's failure never aborts its siblings
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use waybill::{CourierAdapter, Tracker, TrackingError, TrackingResult};
//!
//! # struct Ups;
//! # #[async_trait::async_trait]
//! # impl CourierAdapter for Ups {
//! #     fn name(&self) -> &str { "UPS" }
//! #     fn code(&self) -> &str { "ups" }
//! #     fn detect(&self, n: &str) -> Option<&str> {
//! #         n.starts_with("1Z").then(|| self.code())
//! #     }
//! #     async fn track(&self, _: &str) -> Result<TrackingResult, TrackingError> {
//! #         unimplemented!()
//! #     }
//! # }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tracker = Tracker::builder()
//!         .adapter(Arc::new(Ups))
//!         .build()?;
//!
//!     let result = tracker.track("1Z999AA10123456784", None).await?;
//!     println!("{} events", result.events.len());
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod auth;
pub mod breaker;
pub mod cache;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod limiter;
pub mod middleware;
pub mod model;
pub mod retry;
pub mod sleeper;

// Re-exports
pub use adapter::{CourierAdapter, UNIVERSAL_S10};
pub use auth::{call_with_auth, IssuedToken, TokenEndpoint, TokenManager};
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use cache::ResultCache;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use dispatch::{
    BatchOutcome, RateLimitConfig, RetryConfig, Toggle, Tracker, TrackerBuilder,
    TrackingObserver,
};
pub use error::{SetupError, TrackingError};
pub use limiter::{KeyedRateLimiter, RateLimitSettings};
pub use middleware::{
    CacheMiddleware, CircuitBreakerMiddleware, LoggingMiddleware, Middleware, Next,
    RateLimitMiddleware, RetryMiddleware,
};
pub use model::{
    RequestContext, TrackingEvent, TrackingRequest, TrackingResult, TrackingStatus,
};
pub use retry::{Backoff, Jitter, RetryPolicy, RetryPolicyBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
