//! Data model shared across the dispatch pipeline.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::adapter::CourierAdapter;

/// One item of work: a tracking number, optionally pinned to a courier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingRequest {
    /// The carrier-issued tracking number.
    pub tracking_number: String,
    /// Explicit courier code; `None` requests auto-detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub courier_code: Option<String>,
}

impl TrackingRequest {
    /// Request with auto-detection.
    pub fn new(tracking_number: impl Into<String>) -> Self {
        Self { tracking_number: tracking_number.into(), courier_code: None }
    }

    /// Request pinned to an explicit courier code.
    pub fn with_courier(tracking_number: impl Into<String>, code: impl Into<String>) -> Self {
        Self { tracking_number: tracking_number.into(), courier_code: Some(code.into()) }
    }
}

/// Normalized shipment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    /// Label created; carrier has the data, not the parcel.
    InfoReceived,
    /// Moving through the carrier network.
    InTransit,
    /// On the last-mile vehicle.
    OutForDelivery,
    /// Delivered to the recipient.
    Delivered,
    /// A delivery attempt failed.
    AttemptFail,
    /// Held, returned, damaged, or otherwise exceptional.
    Exception,
    /// Tracking data aged out on the carrier side.
    Expired,
    /// Known to the carrier, no movement reported yet.
    Pending,
}

/// A single scan/checkpoint in a shipment's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingEvent {
    /// Normalized status, when the carrier's code table maps to one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TrackingStatus>,
    /// Carrier wording for the checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Free-form location string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Checkpoint time, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
}

/// The outcome of one successful terminal carrier call. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingResult {
    /// Normalized event list, most recent last.
    pub events: Vec<TrackingEvent>,
    /// Carrier-estimated delivery time, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_delivery: Option<i64>,
    /// Code of the courier that produced this result.
    pub courier_code: String,
    /// The tracking number that was queried.
    pub tracking_number: String,
    /// Raw carrier payload, untouched.
    pub raw: serde_json::Value,
}

/// Per-request context threaded unchanged through the middleware chain.
///
/// Built once by the dispatcher after courier resolution and shared by
/// reference; middlewares read it and never write it.
#[derive(Clone)]
pub struct RequestContext {
    /// The tracking number being dispatched.
    pub tracking_number: String,
    /// Resolved courier code; also the key for all per-key middleware state.
    pub courier_code: String,
    /// The adapter the terminal call will go to.
    pub adapter: Arc<dyn CourierAdapter>,
}

impl RequestContext {
    /// Build a context for one dispatch.
    pub fn new(
        tracking_number: impl Into<String>,
        courier_code: impl Into<String>,
        adapter: Arc<dyn CourierAdapter>,
    ) -> Self {
        Self {
            tracking_number: tracking_number.into(),
            courier_code: courier_code.into(),
            adapter,
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("tracking_number", &self.tracking_number)
            .field("courier_code", &self.courier_code)
            .field("adapter", &self.adapter.name())
            .finish()
    }
}
