#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use waybill::{CourierAdapter, TrackingError, TrackingResult};

/// Install a test-writer subscriber once so failing tests show pipeline logs.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// A canned successful payload for `code`/`tracking_number`.
pub fn ok_result(code: &str, tracking_number: &str) -> TrackingResult {
    TrackingResult {
        events: vec![],
        estimated_delivery: None,
        courier_code: code.to_string(),
        tracking_number: tracking_number.to_string(),
        raw: json!({ "courier": code }),
    }
}

/// Adapter that answers from a scripted queue of outcomes and counts calls.
/// Once the script runs dry it keeps succeeding.
pub struct ScriptedAdapter {
    code: &'static str,
    prefix: &'static str,
    script: Mutex<VecDeque<Result<(), TrackingError>>>,
    calls: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn succeeding(code: &'static str, prefix: &'static str) -> Arc<Self> {
        Self::scripted(code, prefix, vec![])
    }

    pub fn scripted(
        code: &'static str,
        prefix: &'static str,
        script: Vec<Result<(), TrackingError>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            code,
            prefix,
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CourierAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        self.code
    }

    fn code(&self) -> &str {
        self.code
    }

    fn detect(&self, tracking_number: &str) -> Option<&str> {
        tracking_number.starts_with(self.prefix).then(|| self.code())
    }

    async fn track(&self, tracking_number: &str) -> Result<TrackingResult, TrackingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(())) | None => Ok(ok_result(self.code, tracking_number)),
            Some(Err(err)) => Err(err),
        }
    }
}
