//! Closed error taxonomy, client-safe payloads, and per-kind counters.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Stable classification for every failure the server can surface.
///
/// The numeric codes and kind tags are part of the wire contract and must
/// not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Inbound message could not be parsed at all.
    InvalidMessageFormat,
    /// Unknown `type`/`action` discriminator or control action.
    UnsupportedAction,
    /// Connection cap reached; the connection is closed after this.
    ServerOverloaded,
    /// Message parsed but its payload failed validation.
    InvalidRequestData,
    /// A delegated save/convert/run operation failed.
    OperationFailed,
    /// `user_input` arrived for a session with no pending request.
    NoInputRequested,
    /// `user_input` carried a request id that is no longer current.
    StaleInputRequest,
    /// The referenced session does not exist (for this or any client).
    SessionNotFound,
    /// Reserved; the server does not currently enforce timeouts.
    Timeout,
    /// Anything unanticipated. Details stay server-side.
    InternalError,
}

impl ErrorCode {
    /// Numeric wire code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::InvalidMessageFormat => 1000,
            Self::UnsupportedAction => 1001,
            Self::ServerOverloaded => 1002,
            Self::InvalidRequestData => 1003,
            Self::OperationFailed => 1004,
            Self::NoInputRequested => 1005,
            Self::StaleInputRequest => 1006,
            Self::SessionNotFound => 1007,
            Self::Timeout => 1008,
            Self::InternalError => 1999,
        }
    }

    /// Stable kind tag, used for counters and the wire `error_type` field.
    #[must_use]
    pub const fn kind(self) -> &'static str {
        match self {
            Self::InvalidMessageFormat => "invalid_message_format",
            Self::UnsupportedAction => "unsupported_action",
            Self::ServerOverloaded => "server_overloaded",
            Self::InvalidRequestData => "invalid_request_data",
            Self::OperationFailed => "operation_failed",
            Self::NoInputRequested => "no_input_requested",
            Self::StaleInputRequest => "stale_input_request",
            Self::SessionNotFound => "session_not_found",
            Self::Timeout => "timeout",
            Self::InternalError => "internal_error",
        }
    }
}

/// Dispatch-level error carrying its classification.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DispatchError {
    pub code: ErrorCode,
    pub message: String,
    pub details: HashMap<String, Value>,
}

impl DispatchError {
    /// Create an error with no details.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    /// Attach a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }
}

/// Client-safe error body embedded in responses and error notifications.
///
/// Internal errors are scrubbed: the original message is logged server-side
/// and the client only sees a generic text. Validation-style errors echo
/// the offending input since it originated from the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: u16,
    pub error_type: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, Value>,
}

impl ErrorPayload {
    /// Convert a dispatch error into its client-visible form.
    #[must_use]
    pub fn from_error(err: &DispatchError) -> Self {
        let message = if err.code == ErrorCode::InternalError {
            tracing::error!(detail = %err.message, "internal error");
            "Internal server error".to_string()
        } else {
            err.message.clone()
        };
        Self {
            code: err.code.code(),
            error_type: err.code.kind().to_string(),
            error: message,
            details: err.details.clone(),
        }
    }
}

/// Overall health derived from the error rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Process-wide per-kind error counters.
///
/// Shared between dispatchers, the registry sweep, and the stats surface.
#[derive(Debug, Default)]
pub struct ErrorCounters {
    by_kind: RwLock<HashMap<&'static str, u64>>,
    total: AtomicU64,
}

impl ErrorCounters {
    /// Create a fresh counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence of the given error kind.
    pub fn record(&self, code: ErrorCode) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut map = self
            .by_kind
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *map.entry(code.kind()).or_insert(0) += 1;
    }

    /// Total errors recorded.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Snapshot of per-kind counts.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.by_kind
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| ((*k).to_string(), *v))
            .collect()
    }

    /// Derive health from the error rate over `processed` messages.
    ///
    /// Healthy below 5%, degraded from 5% to 10%, unhealthy above that.
    #[must_use]
    pub fn health(&self, processed: u64) -> HealthStatus {
        if processed == 0 {
            return HealthStatus::Healthy;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.total() as f64 / processed as f64;
        if rate < 0.05 {
            HealthStatus::Healthy
        } else if rate <= 0.10 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(ErrorCode::StaleInputRequest.kind(), "stale_input_request");
        assert_eq!(ErrorCode::SessionNotFound.code(), 1007);
    }

    #[test]
    fn internal_errors_are_scrubbed() {
        let err = DispatchError::new(ErrorCode::InternalError, "secret stack trace");
        let payload = ErrorPayload::from_error(&err);
        assert_eq!(payload.error, "Internal server error");
        assert_eq!(payload.error_type, "internal_error");
    }

    #[test]
    fn validation_errors_echo_message() {
        let err = DispatchError::new(ErrorCode::InvalidRequestData, "Invalid flow_data: EOF")
            .with_detail("field", Value::String("flow_data".into()));
        let payload = ErrorPayload::from_error(&err);
        assert_eq!(payload.error, "Invalid flow_data: EOF");
        assert_eq!(payload.details.len(), 1);
    }

    #[test]
    fn health_thresholds() {
        let counters = ErrorCounters::new();
        assert_eq!(counters.health(0), HealthStatus::Healthy);

        for _ in 0..4 {
            counters.record(ErrorCode::UnsupportedAction);
        }
        // 4 errors over 100 messages: 4%
        assert_eq!(counters.health(100), HealthStatus::Healthy);
        counters.record(ErrorCode::UnsupportedAction);
        // 5%
        assert_eq!(counters.health(100), HealthStatus::Degraded);
        for _ in 0..6 {
            counters.record(ErrorCode::InternalError);
        }
        // 11%
        assert_eq!(counters.health(100), HealthStatus::Unhealthy);

        let snap = counters.snapshot();
        assert_eq!(snap["unsupported_action"], 5);
        assert_eq!(snap["internal_error"], 6);
    }
}
