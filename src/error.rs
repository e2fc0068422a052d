//! Error taxonomy for the tracking pipeline
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Unified error type flowing through the dispatch pipeline.
///
/// Every layer either fully handles an error or rethrows it unchanged; nothing
/// in the pipeline wraps errors, so the variant a caller sees is the variant
/// the failing layer produced. The type is `Clone` (payloads live behind
/// `Arc`) so a single token-refresh failure can be fanned out to every caller
/// waiting on the same in-flight refresh.
#[derive(Debug, Clone)]
pub enum TrackingError {
    /// Setup/request problem: missing credentials, bad options.
    Config {
        /// Human-readable description of the misconfiguration.
        reason: String,
    },
    /// An explicit courier code with no registered adapter.
    UnknownCourier {
        /// The code the caller supplied.
        code: String,
    },
    /// No registered adapter's grammar matched the tracking number.
    Undetectable {
        /// The tracking number that failed detection.
        tracking_number: String,
    },
    /// Token refresh failed, or a token was rejected twice in a row.
    Auth {
        /// What went wrong while authenticating.
        reason: String,
    },
    /// The carrier rejected a token it previously issued (HTTP 401).
    ///
    /// Consumed by the reactive re-auth path, which invalidates the cached
    /// token and repeats the data call exactly once. It only reaches callers
    /// when a freshly obtained token is rejected as well, and is then reported
    /// as [`TrackingError::Auth`].
    AuthExpired,
    /// Carrier-reported business failure inside an otherwise successful
    /// exchange (e.g. "tracking number not found").
    Provider {
        /// Carrier-specific error code, when one was supplied.
        code: Option<String>,
        /// Carrier-supplied message.
        message: String,
        /// Raw carrier payload, kept verbatim for diagnostics.
        raw: Arc<serde_json::Value>,
    },
    /// HTTP 429/5xx or a connection-level failure; eligible for retry.
    Transient {
        /// HTTP status when the failure carried one; `None` for
        /// connection-level failures.
        status: Option<u16>,
        /// Transport-supplied description.
        message: String,
    },
    /// Raised without any downstream call while a circuit is open.
    CircuitOpen {
        /// Consecutive failures recorded when the circuit tripped.
        failure_count: usize,
        /// How long the circuit has been open.
        open_for: Duration,
    },
}

impl fmt::Display for TrackingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { reason } => write!(f, "configuration error: {}", reason),
            Self::UnknownCourier { code } => {
                write!(f, "no adapter registered for courier '{}'", code)
            }
            Self::Undetectable { tracking_number } => {
                write!(f, "could not detect a courier for '{}'", tracking_number)
            }
            Self::Auth { reason } => write!(f, "authentication failed: {}", reason),
            Self::AuthExpired => write!(f, "carrier rejected the access token (401)"),
            Self::Provider { code, message, .. } => match code {
                Some(code) => write!(f, "carrier error {}: {}", code, message),
                None => write!(f, "carrier error: {}", message),
            },
            Self::Transient { status, message } => match status {
                Some(status) => write!(f, "transient failure (HTTP {}): {}", status, message),
                None => write!(f, "transient failure: {}", message),
            },
            Self::CircuitOpen { failure_count, open_for } => {
                write!(f, "circuit open ({} failures, open for {:?})", failure_count, open_for)
            }
        }
    }
}

impl std::error::Error for TrackingError {}

impl TrackingError {
    /// Classify a carrier HTTP status into the pipeline taxonomy.
    ///
    /// 401 becomes [`TrackingError::AuthExpired`] so the re-auth path can
    /// react; 429 and 5xx become [`TrackingError::Transient`]; every other
    /// status is a [`TrackingError::Provider`] failure.
    pub fn from_status(status: u16, message: impl Into<String>, raw: serde_json::Value) -> Self {
        let message = message.into();
        match status {
            401 => Self::AuthExpired,
            429 => Self::Transient { status: Some(429), message },
            s if s >= 500 => Self::Transient { status: Some(s), message },
            _ => Self::Provider { code: Some(status.to_string()), message, raw: Arc::new(raw) },
        }
    }

    /// Connection-level failure with no HTTP status (DNS, reset, timeout).
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Transient { status: None, message: message.into() }
    }

    /// True iff the retry executor may repeat the call: HTTP 429, 5xx, or a
    /// connection-level failure. Everything else fails on first occurrence.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { status, .. } => match status {
                Some(s) => *s == 429 || *s >= 500,
                None => true,
            },
            _ => false,
        }
    }

    /// Check whether this error was synthesized by an open circuit.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Check whether this is the reactive 401 signal.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired)
    }

    /// Check whether this is any authentication failure (refresh or 401).
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::AuthExpired)
    }

    /// Check whether this is a carrier business error.
    pub fn is_provider(&self) -> bool {
        matches!(self, Self::Provider { .. })
    }

    /// Check whether detection or courier resolution failed.
    pub fn is_resolution(&self) -> bool {
        matches!(self, Self::UnknownCourier { .. } | Self::Undetectable { .. })
    }

    /// Borrow the raw carrier payload, if this error carries one.
    pub fn raw_payload(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Provider { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

/// Errors produced while validating pipeline configuration at build time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetupError {
    /// Retry attempt budget must allow at least one attempt.
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
    /// A breaker that can trip must be able to recover.
    #[error("reset_timeout must be > 0 (got {0:?})")]
    InvalidResetTimeout(Duration),
    /// Failure threshold must be reachable.
    #[error("failure_threshold must be > 0 (got {0})")]
    InvalidFailureThreshold(usize),
    /// A zero TTL would make every cache read a miss.
    #[error("cache ttl must be > 0 (got {0:?})")]
    InvalidTtl(Duration),
    /// A limiter key must admit at least one in-flight call.
    #[error("max_concurrent must be > 0 for key '{key}' (got {provided})")]
    InvalidConcurrency {
        /// Limiter key the bad setting was supplied for.
        key: String,
        /// Value provided by the caller.
        provided: usize,
    },
}
