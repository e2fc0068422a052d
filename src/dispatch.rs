//! Courier registry and request dispatcher.
//!
//! The [`Tracker`] owns the adapter registry and the resolved middleware
//! chain. Registration happens only at build time through
//! [`TrackerBuilder`]; live dispatch never mutates the registry, so no
//! locking is needed on the hot path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;

use crate::adapter::CourierAdapter;
use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::cache::ResultCache;
use crate::error::{SetupError, TrackingError};
use crate::limiter::{KeyedRateLimiter, RateLimitSettings};
use crate::middleware::{
    CacheMiddleware, CircuitBreakerMiddleware, LoggingMiddleware, Middleware, Next,
    RateLimitMiddleware, RetryMiddleware, Terminal,
};
use crate::model::{RequestContext, TrackingRequest, TrackingResult};
use crate::retry::RetryPolicy;

/// Per-request observability signals, delivered synchronously.
///
/// Handlers return nothing and receive shared references, so a subscriber can
/// observe a dispatch but never alter its outcome.
pub trait TrackingObserver: Send + Sync {
    /// Fired after courier resolution, before the chain runs.
    fn on_start(&self, _tracking_number: &str, _courier_code: &str) {}
    /// Fired when the chain produced a result.
    fn on_success(&self, _tracking_number: &str, _courier_code: &str, _result: &TrackingResult) {}
    /// Fired when the chain (or resolution) produced an error.
    fn on_error(&self, _tracking_number: &str, _courier_code: &str, _error: &TrackingError) {}
}

/// One entry of a [`Tracker::track_batch`] response.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// The tracking number this entry answers for.
    pub tracking_number: String,
    /// The item's result or its error; siblings are unaffected either way.
    pub outcome: Result<TrackingResult, TrackingError>,
}

impl BatchOutcome {
    /// The result, when the item succeeded.
    pub fn result(&self) -> Option<&TrackingResult> {
        self.outcome.as_ref().ok()
    }

    /// The error, when the item failed.
    pub fn error(&self) -> Option<&TrackingError> {
        self.outcome.as_ref().err()
    }
}

/// Enable/disable switch for one middleware, resolved once at build time.
#[derive(Debug, Clone, Default)]
pub enum Toggle<C> {
    /// Leave the middleware out of the chain.
    Disabled,
    /// Include it with its default tuning.
    #[default]
    Defaults,
    /// Include it with explicit tuning.
    Custom(C),
}

/// Tuning for the retry middleware.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts (initial + retries).
    pub max_attempts: usize,
    /// Base delay of the doubling backoff schedule.
    pub base_delay: Duration,
    /// Optional cap on any single delay.
    pub max_delay: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_millis(500), max_delay: None }
    }
}

/// Tuning for the rate-limit middleware.
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfig {
    /// Budget for keys without an override.
    pub fallback: RateLimitSettings,
    /// Per-courier budgets.
    pub per_key: HashMap<String, RateLimitSettings>,
}

impl RateLimitConfig {
    /// Budgets matching the published quotas of the majors; unknown keys get
    /// the conservative fallback.
    pub fn well_known() -> Self {
        let mut per_key = HashMap::new();
        per_key.insert("ups".into(), RateLimitSettings::new(8, Duration::from_millis(100)));
        per_key.insert("fedex".into(), RateLimitSettings::new(8, Duration::from_millis(100)));
        per_key.insert("usps".into(), RateLimitSettings::new(4, Duration::from_millis(250)));
        per_key.insert("dhl".into(), RateLimitSettings::new(2, Duration::from_millis(500)));
        Self { fallback: RateLimitSettings::default(), per_key }
    }
}

/// Unified dispatch front: routes a tracking number to its carrier adapter
/// through the configured middleware chain.
pub struct Tracker {
    adapters: Vec<Arc<dyn CourierAdapter>>,
    universal_owners: HashMap<String, String>,
    middlewares: Vec<Arc<dyn Middleware>>,
    observers: Vec<Arc<dyn TrackingObserver>>,
}

impl Tracker {
    /// Start building a tracker.
    pub fn builder() -> TrackerBuilder {
        TrackerBuilder::new()
    }

    /// Codes of the registered adapters, in registration order.
    pub fn courier_codes(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.code()).collect()
    }

    fn adapter_by_code(&self, code: &str) -> Option<Arc<dyn CourierAdapter>> {
        self.adapters.iter().find(|a| a.code() == code).cloned()
    }

    /// Resolve the adapter for a request: explicit code when given, adapter
    /// grammar detection otherwise. Universal matches (S10) resolve through
    /// the declared-ownership table.
    fn resolve(
        &self,
        tracking_number: &str,
        courier_code: Option<&str>,
    ) -> Result<Arc<dyn CourierAdapter>, TrackingError> {
        if let Some(code) = courier_code {
            return self
                .adapter_by_code(code)
                .ok_or_else(|| TrackingError::UnknownCourier { code: code.to_string() });
        }

        for adapter in &self.adapters {
            let Some(matched) = adapter.detect(tracking_number) else { continue };
            if matched == adapter.code() {
                return Ok(adapter.clone());
            }
            // A universal family matched; hand the number to its owner.
            if let Some(owner) = self.universal_owners.get(matched) {
                if let Some(owner) = self.adapter_by_code(owner) {
                    return Ok(owner);
                }
            }
        }

        Err(TrackingError::Undetectable { tracking_number: tracking_number.to_string() })
    }

    fn notify_start(&self, tracking_number: &str, courier_code: &str) {
        for observer in &self.observers {
            observer.on_start(tracking_number, courier_code);
        }
    }

    fn notify_success(&self, tracking_number: &str, courier_code: &str, result: &TrackingResult) {
        for observer in &self.observers {
            observer.on_success(tracking_number, courier_code, result);
        }
    }

    fn notify_error(&self, tracking_number: &str, courier_code: &str, error: &TrackingError) {
        for observer in &self.observers {
            observer.on_error(tracking_number, courier_code, error);
        }
    }

    /// Track one shipment. Resolution failures are reported before any
    /// middleware runs; chain errors reach the caller with their original
    /// identity intact.
    pub async fn track(
        &self,
        tracking_number: &str,
        courier_code: Option<&str>,
    ) -> Result<TrackingResult, TrackingError> {
        let adapter = match self.resolve(tracking_number, courier_code) {
            Ok(adapter) => adapter,
            Err(err) => {
                self.notify_error(tracking_number, courier_code.unwrap_or(""), &err);
                return Err(err);
            }
        };

        let code = adapter.code().to_string();
        let ctx = RequestContext::new(tracking_number, code, adapter);
        self.notify_start(&ctx.tracking_number, &ctx.courier_code);

        let terminal: Box<Terminal> = Box::new(|ctx: &RequestContext| {
            let adapter = ctx.adapter.clone();
            let tracking_number = ctx.tracking_number.clone();
            async move { adapter.track(&tracking_number).await }.boxed()
        });

        let outcome = Next::chain(&self.middlewares, terminal.as_ref()).run(&ctx).await;
        match &outcome {
            Ok(result) => self.notify_success(&ctx.tracking_number, &ctx.courier_code, result),
            Err(err) => self.notify_error(&ctx.tracking_number, &ctx.courier_code, err),
        }
        outcome
    }

    /// Track many shipments concurrently. Every item produces an outcome;
    /// one item's failure never aborts its siblings.
    pub async fn track_batch(&self, items: &[TrackingRequest]) -> Vec<BatchOutcome> {
        let dispatches = items.iter().map(|item| async move {
            BatchOutcome {
                tracking_number: item.tracking_number.clone(),
                outcome: self.track(&item.tracking_number, item.courier_code.as_deref()).await,
            }
        });
        join_all(dispatches).await
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("adapters", &self.courier_codes())
            .field("middlewares", &self.middlewares.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

/// Builder resolving adapters, observers, and middleware toggles into a
/// [`Tracker`]. All mutation happens here; the built tracker is immutable.
pub struct TrackerBuilder {
    adapters: Vec<Arc<dyn CourierAdapter>>,
    observers: Vec<Arc<dyn TrackingObserver>>,
    logging: Toggle<()>,
    cache: Toggle<Duration>,
    breaker: Toggle<CircuitBreakerConfig>,
    retry: Toggle<RetryConfig>,
    rate_limit: Toggle<RateLimitConfig>,
}

impl TrackerBuilder {
    /// Builder with every middleware at its default tuning.
    pub fn new() -> Self {
        Self {
            adapters: Vec::new(),
            observers: Vec::new(),
            logging: Toggle::Defaults,
            cache: Toggle::Defaults,
            breaker: Toggle::Defaults,
            retry: Toggle::Defaults,
            rate_limit: Toggle::Defaults,
        }
    }

    /// Register an adapter. Registering a second adapter for the same code
    /// replaces the first; the last registration wins.
    pub fn adapter(mut self, adapter: Arc<dyn CourierAdapter>) -> Self {
        if let Some(existing) =
            self.adapters.iter_mut().find(|a| a.code() == adapter.code())
        {
            tracing::warn!(
                courier = adapter.code(),
                "adapter replaced; last registration wins"
            );
            *existing = adapter;
        } else {
            self.adapters.push(adapter);
        }
        self
    }

    /// Remove a previously registered adapter.
    pub fn deregister(mut self, code: &str) -> Self {
        self.adapters.retain(|a| a.code() != code);
        self
    }

    /// Subscribe an observer to the per-request signals.
    pub fn observer(mut self, observer: Arc<dyn TrackingObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Toggle the logging middleware.
    pub fn logging(mut self, toggle: Toggle<()>) -> Self {
        self.logging = toggle;
        self
    }

    /// Toggle the cache middleware; `Custom` carries the TTL.
    pub fn cache(mut self, toggle: Toggle<Duration>) -> Self {
        self.cache = toggle;
        self
    }

    /// Toggle the circuit-breaker middleware.
    pub fn circuit_breaker(mut self, toggle: Toggle<CircuitBreakerConfig>) -> Self {
        self.breaker = toggle;
        self
    }

    /// Toggle the retry middleware.
    pub fn retry(mut self, toggle: Toggle<RetryConfig>) -> Self {
        self.retry = toggle;
        self
    }

    /// Toggle the rate-limit middleware. `Defaults` applies
    /// [`RateLimitConfig::well_known`]: published per-carrier budgets with a
    /// conservative fallback for unrecognized keys.
    pub fn rate_limit(mut self, toggle: Toggle<RateLimitConfig>) -> Self {
        self.rate_limit = toggle;
        self
    }

    /// Resolve toggles into the concrete ordered chain and build.
    ///
    /// Chain order (outermost first): logging, cache, circuit breaker, retry,
    /// rate limit. The breaker sits outside retry so a breaker-open rejection
    /// is never fed back into the retry classifier.
    pub fn build(self) -> Result<Tracker, SetupError> {
        let mut middlewares: Vec<Arc<dyn Middleware>> = Vec::new();

        match self.logging {
            Toggle::Disabled => {}
            Toggle::Defaults | Toggle::Custom(()) => {
                middlewares.push(Arc::new(LoggingMiddleware));
            }
        }

        match self.cache {
            Toggle::Disabled => {}
            Toggle::Defaults => {
                middlewares.push(Arc::new(CacheMiddleware::new(ResultCache::new())));
            }
            Toggle::Custom(ttl) => {
                middlewares.push(Arc::new(CacheMiddleware::new(ResultCache::with_ttl(ttl)?)));
            }
        }

        match self.breaker {
            Toggle::Disabled => {}
            Toggle::Defaults => {
                middlewares.push(Arc::new(CircuitBreakerMiddleware::new(
                    CircuitBreaker::with_config(CircuitBreakerConfig::default()),
                )));
            }
            Toggle::Custom(config) => {
                middlewares.push(Arc::new(CircuitBreakerMiddleware::new(
                    CircuitBreaker::with_config(config),
                )));
            }
        }

        match self.retry {
            Toggle::Disabled => {}
            Toggle::Defaults => {
                middlewares
                    .push(Arc::new(RetryMiddleware::new(RetryPolicy::builder().build()?)));
            }
            Toggle::Custom(config) => {
                let mut backoff = crate::retry::Backoff::exponential(config.base_delay);
                if let Some(max) = config.max_delay {
                    backoff = backoff.with_max(max);
                }
                let policy = RetryPolicy::builder()
                    .max_attempts(config.max_attempts)
                    .backoff(backoff)
                    .build()?;
                middlewares.push(Arc::new(RetryMiddleware::new(policy)));
            }
        }

        let rate_limit = match self.rate_limit {
            Toggle::Disabled => None,
            Toggle::Defaults => Some(RateLimitConfig::well_known()),
            Toggle::Custom(config) => Some(config),
        };
        if let Some(config) = rate_limit {
            let limiter = KeyedRateLimiter::with_settings(config.fallback, config.per_key)?;
            middlewares.push(Arc::new(RateLimitMiddleware::new(limiter)));
        }

        let mut universal_owners = HashMap::new();
        for adapter in &self.adapters {
            for universal in adapter.universal_codes() {
                universal_owners.insert(universal.to_string(), adapter.code().to_string());
            }
        }

        Ok(Tracker {
            adapters: self.adapters,
            universal_owners,
            middlewares,
            observers: self.observers,
        })
    }
}

impl Default for TrackerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{grammar, UNIVERSAL_S10};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeAdapter {
        code: &'static str,
        universal: &'static [&'static str],
        prefix: &'static str,
        calls: AtomicUsize,
    }

    impl FakeAdapter {
        fn new(code: &'static str, prefix: &'static str) -> Arc<Self> {
            Arc::new(Self { code, universal: &[], prefix, calls: AtomicUsize::new(0) })
        }

        fn postal(code: &'static str) -> Arc<Self> {
            Arc::new(Self {
                code,
                universal: &[UNIVERSAL_S10],
                prefix: "",
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CourierAdapter for FakeAdapter {
        fn name(&self) -> &str {
            self.code
        }
        fn code(&self) -> &str {
            self.code
        }
        fn universal_codes(&self) -> &[&str] {
            self.universal
        }
        fn detect(&self, tracking_number: &str) -> Option<&str> {
            if !self.prefix.is_empty() && tracking_number.starts_with(self.prefix) {
                return Some(self.code);
            }
            if self.universal.contains(&UNIVERSAL_S10) && grammar::is_s10(tracking_number) {
                return Some(UNIVERSAL_S10);
            }
            None
        }
        async fn track(&self, tracking_number: &str) -> Result<TrackingResult, TrackingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TrackingResult {
                events: vec![],
                estimated_delivery: None,
                courier_code: self.code.into(),
                tracking_number: tracking_number.into(),
                raw: json!({}),
            })
        }
    }

    fn bare_tracker(adapters: Vec<Arc<dyn CourierAdapter>>) -> Tracker {
        let mut builder = Tracker::builder()
            .logging(Toggle::Disabled)
            .cache(Toggle::Disabled)
            .circuit_breaker(Toggle::Disabled)
            .retry(Toggle::Disabled)
            .rate_limit(Toggle::Disabled);
        for adapter in adapters {
            builder = builder.adapter(adapter);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn explicit_code_dispatches_to_adapter() {
        let ups = FakeAdapter::new("ups", "1Z");
        let tracker = bare_tracker(vec![ups.clone() as Arc<dyn CourierAdapter>]);

        let result = tracker.track("1Z999AA1", Some("ups")).await.unwrap();
        assert_eq!(result.courier_code, "ups");
        assert_eq!(ups.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_explicit_code_fails_fast() {
        let tracker =
            bare_tracker(vec![FakeAdapter::new("ups", "1Z") as Arc<dyn CourierAdapter>]);
        let err = tracker.track("1Z999AA1", Some("teleport")).await.unwrap_err();
        assert!(matches!(err, TrackingError::UnknownCourier { code } if code == "teleport"));
    }

    #[tokio::test]
    async fn detection_routes_by_grammar() {
        let ups = FakeAdapter::new("ups", "1Z");
        let fedex = FakeAdapter::new("fedex", "96");
        let tracker =
            bare_tracker(vec![ups.clone() as Arc<dyn CourierAdapter>, fedex.clone()]);

        let result = tracker.track("9612345", None).await.unwrap();
        assert_eq!(result.courier_code, "fedex");
        assert_eq!(ups.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn universal_match_resolves_to_declared_owner() {
        let ups = FakeAdapter::new("ups", "1Z");
        let postal = FakeAdapter::postal("china-post");
        let tracker = bare_tracker(vec![ups as Arc<dyn CourierAdapter>, postal.clone()]);

        let result = tracker.track("RR123456785CN", None).await.unwrap();
        assert_eq!(result.courier_code, "china-post");
        assert_eq!(postal.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn undetectable_number_fails_fast() {
        let tracker = bare_tracker(vec![FakeAdapter::new("ups", "1Z")]);
        let err = tracker.track("completely-opaque", None).await.unwrap_err();
        assert!(matches!(err, TrackingError::Undetectable { .. }));
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let first = FakeAdapter::new("ups", "1Z");
        let second = FakeAdapter::new("ups", "1Z");
        let tracker =
            bare_tracker(vec![first.clone() as Arc<dyn CourierAdapter>, second.clone()]);

        assert_eq!(tracker.courier_codes(), vec!["ups"]);
        tracker.track("1Z1", Some("ups")).await.unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn deregister_removes_adapter() {
        let tracker = {
            let builder = Tracker::builder()
                .logging(Toggle::Disabled)
                .cache(Toggle::Disabled)
                .circuit_breaker(Toggle::Disabled)
                .retry(Toggle::Disabled)
                .rate_limit(Toggle::Disabled)
                .adapter(FakeAdapter::new("ups", "1Z"))
                .deregister("ups");
            builder.build().unwrap()
        };
        let err = tracker.track("1Z1", Some("ups")).await.unwrap_err();
        assert!(matches!(err, TrackingError::UnknownCourier { .. }));
    }

    #[derive(Default)]
    struct SignalLog {
        entries: Mutex<Vec<String>>,
    }

    impl TrackingObserver for SignalLog {
        fn on_start(&self, number: &str, code: &str) {
            self.entries.lock().unwrap().push(format!("start:{}:{}", code, number));
        }
        fn on_success(&self, number: &str, code: &str, _result: &TrackingResult) {
            self.entries.lock().unwrap().push(format!("success:{}:{}", code, number));
        }
        fn on_error(&self, number: &str, code: &str, error: &TrackingError) {
            self.entries
                .lock()
                .unwrap()
                .push(format!("error:{}:{}:{}", code, number, error));
        }
    }

    #[tokio::test]
    async fn observer_sees_start_then_success_in_order() {
        let log = Arc::new(SignalLog::default());
        let tracker = Tracker::builder()
            .logging(Toggle::Disabled)
            .cache(Toggle::Disabled)
            .circuit_breaker(Toggle::Disabled)
            .retry(Toggle::Disabled)
            .rate_limit(Toggle::Disabled)
            .adapter(FakeAdapter::new("ups", "1Z"))
            .observer(log.clone())
            .build()
            .unwrap();

        tracker.track("1Z42", None).await.unwrap();

        let entries = log.entries.lock().unwrap().clone();
        assert_eq!(entries, vec!["start:ups:1Z42", "success:ups:1Z42"]);
    }

    #[tokio::test]
    async fn batch_partial_failure() {
        let tracker =
            bare_tracker(vec![FakeAdapter::new("ups", "1Z") as Arc<dyn CourierAdapter>]);
        let items = vec![
            TrackingRequest::with_courier("1Z650", "ups"),
            TrackingRequest::with_courier("XX123", "hover-drone"),
        ];

        let outcomes = tracker.track_batch(&items).await;
        assert_eq!(outcomes.len(), 2);

        assert_eq!(outcomes[0].tracking_number, "1Z650");
        assert!(outcomes[0].result().is_some());
        assert!(outcomes[0].error().is_none());

        assert_eq!(outcomes[1].tracking_number, "XX123");
        assert!(outcomes[1].result().is_none());
        assert!(matches!(
            outcomes[1].error(),
            Some(TrackingError::UnknownCourier { code }) if code == "hover-drone"
        ));
    }

    struct Mod10Carrier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CourierAdapter for Mod10Carrier {
        fn name(&self) -> &str {
            "dpd"
        }
        fn code(&self) -> &str {
            "dpd"
        }
        fn detect(&self, tracking_number: &str) -> Option<&str> {
            grammar::is_luhn_valid(tracking_number).then(|| self.code())
        }
        async fn track(&self, tracking_number: &str) -> Result<TrackingResult, TrackingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TrackingResult {
                events: vec![],
                estimated_delivery: None,
                courier_code: "dpd".into(),
                tracking_number: tracking_number.into(),
                raw: json!({}),
            })
        }
    }

    #[tokio::test]
    async fn detection_accepts_mod10_numeric_grammar() {
        let carrier = Arc::new(Mod10Carrier { calls: AtomicUsize::new(0) });
        let tracker = bare_tracker(vec![
            FakeAdapter::new("ups", "1Z") as Arc<dyn CourierAdapter>,
            carrier.clone(),
        ]);

        let result = tracker.track("79927398713", None).await.unwrap();
        assert_eq!(result.courier_code, "dpd");
        assert_eq!(carrier.calls.load(Ordering::SeqCst), 1);

        // Same shape, bad check digit: no grammar claims it.
        let err = tracker.track("79927398710", None).await.unwrap_err();
        assert!(matches!(err, TrackingError::Undetectable { .. }));
    }

    #[test]
    fn well_known_rate_limits_cover_the_majors() {
        let config = RateLimitConfig::well_known();
        assert!(config.per_key.contains_key("ups"));
        assert!(config.per_key.contains_key("usps"));
        assert_eq!(config.fallback, RateLimitSettings::default());
    }
}
