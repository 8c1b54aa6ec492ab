use crate::error::ConnectorError;
use lifeline_core_resilience::CircuitState;
use serde::{Deserialize, Serialize};

/// Bookkeeping attached to every connector response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    /// Attempts beyond the first
    pub retry_count: u32,
    pub circuit_breaker_state: CircuitState,
    /// Served from the response cache
    #[serde(default)]
    pub cached: bool,
    /// Served from cache past its TTL, under stale-while-revalidate
    #[serde(default)]
    pub stale: bool,
}

/// The only shape callers of `execute` ever see
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ConnectorError>,
    pub metadata: ResponseMetadata,
}

impl<T> ConnectorResponse<T> {
    pub fn ok(data: T, metadata: ResponseMetadata) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata,
        }
    }

    pub fn err(error: ConnectorError, metadata: ResponseMetadata) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            metadata,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }

    /// Convert data while keeping metadata; a failed conversion turns the
    /// response into a failure
    pub fn try_map<U, E, F>(self, f: F) -> ConnectorResponse<U>
    where
        F: FnOnce(T) -> Result<U, E>,
        E: std::fmt::Display,
    {
        match (self.data, self.error) {
            (Some(data), None) => match f(data) {
                Ok(data) => ConnectorResponse::ok(data, self.metadata),
                Err(e) => ConnectorResponse::err(
                    ConnectorError::new(crate::error::codes::DECODE_ERROR, e.to_string()),
                    self.metadata,
                ),
            },
            (_, Some(error)) => ConnectorResponse::err(error, self.metadata),
            (None, None) => ConnectorResponse::err(
                ConnectorError::new(crate::error::codes::UNKNOWN_ERROR, "response carried no data"),
                self.metadata,
            ),
        }
    }

    pub fn into_result(self) -> Result<T, ConnectorError> {
        match (self.data, self.error) {
            (_, Some(error)) => Err(error),
            (Some(data), None) => Ok(data),
            (None, None) => Err(ConnectorError::new(
                crate::error::codes::UNKNOWN_ERROR,
                "response carried no data",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata() -> ResponseMetadata {
        ResponseMetadata {
            request_id: "req-1".into(),
            status_code: Some(200),
            response_time_ms: 12,
            retry_count: 0,
            circuit_breaker_state: CircuitState::Closed,
            cached: false,
            stale: false,
        }
    }

    #[test]
    fn test_serializes_camel_case() {
        let response = ConnectorResponse::ok(json!({"id": 1}), metadata());
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["metadata"]["requestId"], "req-1");
        assert_eq!(value["metadata"]["circuitBreakerState"], "closed");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_try_map_decode_failure() {
        let response = ConnectorResponse::ok(json!("not a number"), metadata());
        let mapped = response.try_map(serde_json::from_value::<u32>);
        assert!(!mapped.success);
        assert_eq!(mapped.error_code(), Some("DECODE_ERROR"));
        assert_eq!(mapped.metadata.request_id, "req-1");
    }

    #[test]
    fn test_into_result() {
        let failed: ConnectorResponse<u32> =
            ConnectorResponse::err(ConnectorError::new("HTTP_404", "missing"), metadata());
        assert_eq!(failed.into_result().unwrap_err().code, "HTTP_404");
    }
}
