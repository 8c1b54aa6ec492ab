/*!
 * Error types for Lifeline connectors
 *
 * `ConnectError` is what the framework raises internally. `ConnectorError`
 * is the serializable, normalized form that `BaseConnector::execute` hands
 * back to callers inside a `ConnectorResponse`; callers never see a raised
 * error from a well-formed call.
 */

use chrono::{DateTime, Utc};
use lifeline_core_resilience::{ErrorSignature, ResilienceError, RetryExhausted, TimeoutError};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConnectError>;

/// Stable error codes surfaced in `ConnectorError::code`
pub mod codes {
    pub const CIRCUIT_BREAKER_OPEN: &str = "CIRCUIT_BREAKER_OPEN";
    pub const RETRY_EXHAUSTED: &str = "RETRY_EXHAUSTED";
    pub const TIMEOUT: &str = "ETIMEDOUT";
    pub const CANCELLED: &str = "REQUEST_CANCELLED";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const CONFIG_ERROR: &str = "CONFIG_ERROR";
    pub const DECODE_ERROR: &str = "DECODE_ERROR";
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const HEALTH_CHECK_FAILED: &str = "HEALTH_CHECK_FAILED";
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
}

#[derive(Error, Debug)]
pub enum ConnectError {
    /// The connector's circuit breaker is rejecting traffic
    #[error("circuit breaker open for connector '{connector_id}'")]
    CircuitOpen { connector_id: String },

    /// Every attempt failed, or the last failure was not retryable
    #[error("retry exhausted after {attempts} attempt(s): {source}")]
    RetryExhausted {
        attempts: u32,
        delays: Vec<Duration>,
        #[source]
        source: Box<ConnectError>,
    },

    /// A single attempt exceeded its deadline
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Non-2xx response from the external service
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        body: Option<String>,
    },

    /// Transport-level failure before a response was received
    #[error("{message}")]
    Transport {
        code: Option<String>,
        message: String,
    },

    /// Credentials missing, rejected, or token acquisition failed
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Invalid connector or framework configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Response body could not be decoded
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The caller cancelled the call
    #[error("request cancelled")]
    Cancelled,

    /// Rate limiter rejected or timed out the call
    #[error("rate limited: {0}")]
    RateLimited(ResilienceError),

    /// Failure with an explicit code, e.g. raised by a custom connector
    #[error("{message}")]
    Coded {
        code: String,
        message: String,
        status_code: Option<u16>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ConnectError {
    /// Transport failure carrying a Node-style errno code
    pub fn transport(code: impl Into<String>, message: impl Into<String>) -> Self {
        ConnectError::Transport {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Failure with an explicit, caller-chosen code
    pub fn coded(code: impl Into<String>, message: impl Into<String>) -> Self {
        ConnectError::Coded {
            code: code.into(),
            message: message.into(),
            status_code: None,
        }
    }

    /// Stable code used in `ConnectorError::code`
    pub fn code(&self) -> String {
        match self {
            ConnectError::CircuitOpen { .. } => codes::CIRCUIT_BREAKER_OPEN.to_string(),
            ConnectError::RetryExhausted { .. } => codes::RETRY_EXHAUSTED.to_string(),
            ConnectError::Timeout(_) => codes::TIMEOUT.to_string(),
            ConnectError::Http { status, .. } => format!("HTTP_{status}"),
            ConnectError::Transport { code, .. } => code
                .clone()
                .unwrap_or_else(|| codes::NETWORK_ERROR.to_string()),
            ConnectError::Auth(_) => codes::AUTH_FAILED.to_string(),
            ConnectError::Config(_) => codes::CONFIG_ERROR.to_string(),
            ConnectError::Decode(_) => codes::DECODE_ERROR.to_string(),
            ConnectError::Cancelled => codes::CANCELLED.to_string(),
            ConnectError::RateLimited(e) => e
                .code()
                .map(|c| c.into_owned())
                .unwrap_or_else(|| codes::UNKNOWN_ERROR.to_string()),
            ConnectError::Coded { code, .. } => code.clone(),
            ConnectError::Io(_) => codes::NETWORK_ERROR.to_string(),
        }
    }

    /// HTTP status of this error or of the error a retry loop gave up on
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ConnectError::Http { status, .. } => Some(*status),
            ConnectError::Coded { status_code, .. } => *status_code,
            ConnectError::RetryExhausted { source, .. } => source.http_status(),
            _ => None,
        }
    }

    /// The innermost error, unwrapping retry exhaustion
    pub fn root(&self) -> &ConnectError {
        match self {
            ConnectError::RetryExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Normalize into the caller-facing error shape
    ///
    /// `retryable` is decided by the caller (the connector's retry policy),
    /// so operators can tune it without code changes.
    pub fn to_connector_error(&self, retryable: bool) -> ConnectorError {
        ConnectorError {
            code: self.code(),
            message: self.to_string(),
            status_code: self.http_status(),
            retryable,
            timestamp: Utc::now(),
            details: serde_json::Map::new(),
        }
    }
}

impl ErrorSignature for ConnectError {
    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed(match self {
            ConnectError::CircuitOpen { .. } => "CircuitBreakerOpenError",
            ConnectError::RetryExhausted { .. } => "RetryExhaustedError",
            ConnectError::Timeout(_) => "TimeoutError",
            ConnectError::Http { .. } => "HttpError",
            ConnectError::Transport { .. } | ConnectError::Io(_) => "NetworkError",
            ConnectError::Auth(_) => "AuthError",
            ConnectError::Config(_) => "ConfigError",
            ConnectError::Decode(_) => "DecodeError",
            ConnectError::Cancelled => "AbortError",
            ConnectError::RateLimited(_) => "RateLimitError",
            ConnectError::Coded { .. } => "ConnectorError",
        })
    }

    fn code(&self) -> Option<Cow<'_, str>> {
        match self {
            ConnectError::Transport { code, .. } => code.as_deref().map(Cow::Borrowed),
            ConnectError::Coded { code, .. } => Some(Cow::Borrowed(code.as_str())),
            ConnectError::Timeout(_) => Some(Cow::Borrowed(codes::TIMEOUT)),
            ConnectError::Io(e) => io_errno(e).map(Cow::Borrowed),
            _ => None,
        }
    }

    fn status_code(&self) -> Option<u16> {
        self.http_status()
    }
}

/// Map I/O error kinds to the errno names used in retryable-error lists
fn io_errno(err: &io::Error) -> Option<&'static str> {
    use io::ErrorKind::*;
    match err.kind() {
        ConnectionReset => Some("ECONNRESET"),
        ConnectionRefused => Some("ECONNREFUSED"),
        ConnectionAborted => Some("ECONNABORTED"),
        BrokenPipe => Some("EPIPE"),
        TimedOut => Some("ETIMEDOUT"),
        _ => None,
    }
}

impl From<TimeoutError> for ConnectError {
    fn from(err: TimeoutError) -> Self {
        ConnectError::Timeout(err.timeout)
    }
}

impl From<RetryExhausted<ConnectError>> for ConnectError {
    fn from(err: RetryExhausted<ConnectError>) -> Self {
        ConnectError::RetryExhausted {
            attempts: err.context.attempts,
            delays: err.context.delays,
            source: Box::new(err.last_error),
        }
    }
}

impl From<ResilienceError> for ConnectError {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::CircuitOpen { name } => ConnectError::CircuitOpen { connector_id: name },
            ResilienceError::Timeout(d) => ConnectError::Timeout(d),
            ResilienceError::InvalidConfig(msg) => ConnectError::Config(msg),
            throttled => ConnectError::RateLimited(throttled),
        }
    }
}

impl From<serde_json::Error> for ConnectError {
    fn from(err: serde_json::Error) -> Self {
        ConnectError::Decode(err.to_string())
    }
}

/// Normalized error returned inside a failed `ConnectorResponse`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
    /// Annotations added by error interceptors (correlation id, connector id, ...)
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl ConnectorError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status_code: None,
            retryable: false,
            timestamp: Utc::now(),
            details: serde_json::Map::new(),
        }
    }

    /// Read a string annotation
    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(|v| v.as_str())
    }
}

impl std::fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ConnectorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_codes() {
        assert_eq!(
            ConnectError::CircuitOpen {
                connector_id: "x".into()
            }
            .code(),
            "CIRCUIT_BREAKER_OPEN"
        );
        assert_eq!(
            ConnectError::Http {
                status: 503,
                message: "Service Unavailable".into(),
                body: None
            }
            .code(),
            "HTTP_503"
        );
        assert_eq!(ConnectError::coded("CASE_LOCKED", "locked").code(), "CASE_LOCKED");
        assert_eq!(
            ConnectError::Transport {
                code: None,
                message: "boom".into()
            }
            .code(),
            "NETWORK_ERROR"
        );
    }

    #[test]
    fn test_retry_exhausted_keeps_inner_status() {
        let err = ConnectError::RetryExhausted {
            attempts: 3,
            delays: vec![],
            source: Box::new(ConnectError::Http {
                status: 502,
                message: "Bad Gateway".into(),
                body: None,
            }),
        };
        assert_eq!(err.code(), "RETRY_EXHAUSTED");
        assert_eq!(err.http_status(), Some(502));
        assert!(matches!(err.root(), ConnectError::Http { status: 502, .. }));

        let normalized = err.to_connector_error(true);
        assert_eq!(normalized.status_code, Some(502));
        assert!(normalized.retryable);
    }

    #[test]
    fn test_resilience_error_mapping() {
        let err: ConnectError = ResilienceError::CircuitOpen { name: "morgue".into() }.into();
        assert!(matches!(err, ConnectError::CircuitOpen { ref connector_id } if connector_id == "morgue"));

        let err: ConnectError = ResilienceError::QueueFull {
            name: "morgue".into(),
            capacity: 1,
        }
        .into();
        assert_eq!(err.code(), "RATE_LIMIT_QUEUE_FULL");
    }

    #[test]
    fn test_io_errors_expose_errno() {
        let err = ConnectError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(ErrorSignature::code(&err).as_deref(), Some("ECONNRESET"));
    }

    #[test]
    fn test_connector_error_serializes_camel_case() {
        let mut err = ConnectorError::new("HTTP_404", "not found");
        err.status_code = Some(404);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["statusCode"], 404);
        assert!(json.get("details").is_none());
    }
}
