mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use common::{ok_result, ScriptedAdapter};
use waybill::middleware::Terminal;
use waybill::{
    CacheMiddleware, Middleware, Next, RequestContext, ResultCache, RetryMiddleware,
    RetryPolicy, TrackingError, TrackingResult,
};

/// Middleware that records when control enters and leaves it.
struct Tap {
    label: &'static str,
    trace: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Middleware for Tap {
    async fn handle(
        &self,
        ctx: &RequestContext,
        next: Next<'_>,
    ) -> Result<TrackingResult, TrackingError> {
        self.trace.lock().unwrap().push(format!("{}-before", self.label));
        let outcome = next.run(ctx).await;
        self.trace.lock().unwrap().push(format!("{}-after", self.label));
        outcome
    }
}

fn context(tracking_number: &str) -> RequestContext {
    RequestContext::new(
        tracking_number,
        "ups",
        ScriptedAdapter::succeeding("ups", "1Z"),
    )
}

#[tokio::test]
async fn chain_unwinds_in_onion_order() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let middlewares: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(Tap { label: "outer", trace: trace.clone() }),
        Arc::new(Tap { label: "inner", trace: trace.clone() }),
    ];

    let terminal_trace = trace.clone();
    let terminal: Box<Terminal> = Box::new(move |ctx: &RequestContext| {
        let trace = terminal_trace.clone();
        let result = ok_result(&ctx.courier_code, &ctx.tracking_number);
        async move {
            trace.lock().unwrap().push("terminal".to_string());
            Ok(result)
        }
        .boxed()
    });

    let ctx = context("1Z1");
    Next::chain(&middlewares, terminal.as_ref()).run(&ctx).await.unwrap();

    assert_eq!(
        *trace.lock().unwrap(),
        vec!["outer-before", "inner-before", "terminal", "inner-after", "outer-after"]
    );
}

#[tokio::test]
async fn retry_reruns_only_the_chain_segment_inside_it() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let policy = RetryPolicy::builder()
        .max_attempts(2)
        .backoff(waybill::Backoff::exponential(Duration::from_millis(1)))
        .build()
        .unwrap();

    let middlewares: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(Tap { label: "outside", trace: trace.clone() }),
        Arc::new(RetryMiddleware::new(policy)),
        Arc::new(Tap { label: "inside", trace: trace.clone() }),
    ];

    // Fails the first time through, succeeds on the rerun.
    let failures = Arc::new(Mutex::new(1u32));
    let terminal: Box<Terminal> = Box::new(move |ctx: &RequestContext| {
        let failures = failures.clone();
        let result = ok_result(&ctx.courier_code, &ctx.tracking_number);
        async move {
            let mut remaining = failures.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TrackingError::Transient {
                    status: Some(503),
                    message: "try again".into(),
                });
            }
            Ok(result)
        }
        .boxed()
    });

    let ctx = context("1Z2");
    Next::chain(&middlewares, terminal.as_ref()).run(&ctx).await.unwrap();

    // "outside" wraps the whole dispatch once; "inside" runs once per attempt.
    let entries = trace.lock().unwrap().clone();
    assert_eq!(entries.iter().filter(|e| *e == "outside-before").count(), 1);
    assert_eq!(entries.iter().filter(|e| *e == "inside-before").count(), 2);
}

#[tokio::test]
async fn cache_hit_short_circuits_everything_below_it() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let cache = ResultCache::new();
    let middlewares: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(CacheMiddleware::new(cache)),
        Arc::new(Tap { label: "below", trace: trace.clone() }),
    ];

    let terminal: Box<Terminal> = Box::new(|ctx: &RequestContext| {
        let result = ok_result(&ctx.courier_code, &ctx.tracking_number);
        async move { Ok(result) }.boxed()
    });

    let ctx = context("1Z3");
    let chain = Next::chain(&middlewares, terminal.as_ref());
    let first = chain.run(&ctx).await.unwrap();
    let second = chain.run(&ctx).await.unwrap();

    assert_eq!(first, second);
    // The middleware below the cache ran only for the miss.
    assert_eq!(
        trace.lock().unwrap().iter().filter(|e| *e == "below-before").count(),
        1
    );
}
