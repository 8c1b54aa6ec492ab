//! Built-in interceptors

use super::{
    ErrorInterceptor, InterceptedResponse, RequestContext, RequestInterceptor, ResponseInterceptor,
};
use crate::connector::ConnectorRequest;
use crate::error::{ConnectorError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Keys whose values are masked in redacted copies (case-insensitive)
pub const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "secret",
    "client_secret",
    "token",
    "access_token",
    "refresh_token",
    "api_key",
    "apikey",
    "authorization",
    "ssn",
    "social_security_number",
    "date_of_birth",
];

const REDACTED: &str = "[REDACTED]";

/// Stamps the correlation id on the request, or adopts one the caller set
#[derive(Debug, Clone)]
pub struct CorrelationIdInterceptor {
    header: String,
}

impl Default for CorrelationIdInterceptor {
    fn default() -> Self {
        Self {
            header: CORRELATION_ID_HEADER.to_string(),
        }
    }
}

#[async_trait]
impl RequestInterceptor for CorrelationIdInterceptor {
    fn name(&self) -> &str {
        "correlation-id"
    }

    async fn on_request(
        &self,
        request: ConnectorRequest,
        ctx: &mut RequestContext,
    ) -> Result<ConnectorRequest> {
        if let Some(existing) = request.header_value(&self.header) {
            ctx.correlation_id = existing.to_string();
            return Ok(request);
        }
        Ok(request.header(self.header.clone(), ctx.correlation_id.clone()))
    }
}

/// Defaults `Content-Type` for requests with a body, and `Accept`
#[derive(Debug, Clone)]
pub struct ContentTypeInterceptor {
    content_type: String,
    accept: String,
}

impl Default for ContentTypeInterceptor {
    fn default() -> Self {
        Self {
            content_type: "application/json".to_string(),
            accept: "application/json".to_string(),
        }
    }
}

#[async_trait]
impl RequestInterceptor for ContentTypeInterceptor {
    fn name(&self) -> &str {
        "content-type"
    }

    async fn on_request(
        &self,
        mut request: ConnectorRequest,
        _ctx: &mut RequestContext,
    ) -> Result<ConnectorRequest> {
        if request.body.is_some() && !request.has_header("content-type") {
            request = request.header("Content-Type", self.content_type.clone());
        }
        if !request.has_header("accept") {
            request = request.header("Accept", self.accept.clone());
        }
        Ok(request)
    }
}

#[derive(Debug, Clone)]
pub struct UserAgentInterceptor {
    user_agent: String,
}

impl UserAgentInterceptor {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

impl Default for UserAgentInterceptor {
    fn default() -> Self {
        Self::new(concat!("lifeline/", env!("CARGO_PKG_VERSION")))
    }
}

#[async_trait]
impl RequestInterceptor for UserAgentInterceptor {
    fn name(&self) -> &str {
        "user-agent"
    }

    async fn on_request(
        &self,
        request: ConnectorRequest,
        _ctx: &mut RequestContext,
    ) -> Result<ConnectorRequest> {
        if request.has_header("user-agent") {
            return Ok(request);
        }
        Ok(request.header("User-Agent", self.user_agent.clone()))
    }
}

/// Records elapsed time on the response and in the context
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingInterceptor;

#[async_trait]
impl ResponseInterceptor for TimingInterceptor {
    fn name(&self) -> &str {
        "timing"
    }

    async fn on_response(
        &self,
        mut response: InterceptedResponse,
        ctx: &mut RequestContext,
    ) -> Result<InterceptedResponse> {
        let elapsed = ctx.elapsed();
        ctx.metadata
            .insert("responseTimeMs".to_string(), json!(elapsed.as_millis() as u64));
        response.duration = Some(elapsed);
        Ok(response)
    }
}

/// Traces every stage at debug level, failures at warn
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingInterceptor;

#[async_trait]
impl RequestInterceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_request(
        &self,
        request: ConnectorRequest,
        ctx: &mut RequestContext,
    ) -> Result<ConnectorRequest> {
        debug!(
            connector_id = %ctx.connector_id,
            correlation_id = %ctx.correlation_id,
            method = %request.method,
            path = %request.path,
            "Outgoing request"
        );
        Ok(request)
    }
}

#[async_trait]
impl ResponseInterceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_response(
        &self,
        response: InterceptedResponse,
        ctx: &mut RequestContext,
    ) -> Result<InterceptedResponse> {
        debug!(
            connector_id = %ctx.connector_id,
            correlation_id = %ctx.correlation_id,
            status = response.status,
            elapsed_ms = ctx.elapsed().as_millis() as u64,
            "Response received"
        );
        Ok(response)
    }
}

#[async_trait]
impl ErrorInterceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        "logging"
    }

    async fn on_error(&self, error: ConnectorError, ctx: &mut RequestContext) -> ConnectorError {
        warn!(
            connector_id = %ctx.connector_id,
            correlation_id = %ctx.correlation_id,
            code = %error.code,
            status = ?error.status_code,
            "Request failed: {}",
            error.message
        );
        error
    }
}

/// Writes masked copies of bodies into context metadata
///
/// The request and response themselves pass through untouched; the copies
/// under `redactedRequestBody` / `redactedResponse` are what gets logged or
/// audited.
#[derive(Debug, Clone)]
pub struct RedactionInterceptor {
    fields: Vec<String>,
}

impl RedactionInterceptor {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fields: fields
                .into_iter()
                .map(|f| f.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Copy of `value` with every sensitive key masked, at any depth
    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        let masked = if self.is_sensitive(k) {
                            Value::String(REDACTED.to_string())
                        } else {
                            self.redact(v)
                        };
                        (k.clone(), masked)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            other => other.clone(),
        }
    }

    fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.fields.iter().any(|f| *f == key)
    }
}

impl Default for RedactionInterceptor {
    fn default() -> Self {
        Self::new(DEFAULT_SENSITIVE_FIELDS)
    }
}

#[async_trait]
impl RequestInterceptor for RedactionInterceptor {
    fn name(&self) -> &str {
        "redaction"
    }

    async fn on_request(
        &self,
        request: ConnectorRequest,
        ctx: &mut RequestContext,
    ) -> Result<ConnectorRequest> {
        if let Some(body) = &request.body {
            ctx.metadata
                .insert("redactedRequestBody".to_string(), self.redact(body));
        }
        Ok(request)
    }
}

#[async_trait]
impl ResponseInterceptor for RedactionInterceptor {
    fn name(&self) -> &str {
        "redaction"
    }

    async fn on_response(
        &self,
        response: InterceptedResponse,
        ctx: &mut RequestContext,
    ) -> Result<InterceptedResponse> {
        ctx.metadata
            .insert("redactedResponse".to_string(), self.redact(&response.data));
        Ok(response)
    }
}

/// Attaches correlation and connector ids to every error
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorNormalizationInterceptor;

#[async_trait]
impl ErrorInterceptor for ErrorNormalizationInterceptor {
    fn name(&self) -> &str {
        "error-normalization"
    }

    async fn on_error(&self, mut error: ConnectorError, ctx: &mut RequestContext) -> ConnectorError {
        error
            .details
            .insert("correlationId".to_string(), json!(ctx.correlation_id));
        error
            .details
            .insert("connectorId".to_string(), json!(ctx.connector_id));
        error.details.insert(
            "elapsedMs".to_string(),
            json!(ctx.elapsed().as_millis() as u64),
        );
        if error.message.is_empty() {
            error.message = format!("{} request failed", ctx.connector_id);
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ctx() -> RequestContext {
        RequestContext::new("border", "corr-1")
    }

    #[tokio::test]
    async fn test_correlation_id_stamped_or_adopted() {
        let interceptor = CorrelationIdInterceptor::default();
        let mut c = ctx();
        let out = interceptor
            .on_request(ConnectorRequest::get("/"), &mut c)
            .await
            .unwrap();
        assert_eq!(out.header_value("x-correlation-id"), Some("corr-1"));

        let mut c = ctx();
        interceptor
            .on_request(ConnectorRequest::get("/").header(CORRELATION_ID_HEADER, "upstream"), &mut c)
            .await
            .unwrap();
        assert_eq!(c.correlation_id, "upstream");
    }

    #[tokio::test]
    async fn test_content_type_only_with_body() {
        let interceptor = ContentTypeInterceptor::default();
        let out = interceptor
            .on_request(ConnectorRequest::get("/"), &mut ctx())
            .await
            .unwrap();
        assert!(!out.has_header("content-type"));
        assert_eq!(out.header_value("accept"), Some("application/json"));

        let out = interceptor
            .on_request(ConnectorRequest::post("/", json!({})), &mut ctx())
            .await
            .unwrap();
        assert_eq!(out.header_value("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn test_user_agent_respects_caller() {
        let interceptor = UserAgentInterceptor::new("agent/1");
        let out = interceptor
            .on_request(ConnectorRequest::get("/").header("user-agent", "custom"), &mut ctx())
            .await
            .unwrap();
        assert_eq!(out.header_value("User-Agent"), Some("custom"));
    }

    #[tokio::test]
    async fn test_redaction_leaves_body_intact() {
        let interceptor = RedactionInterceptor::default();
        let body = json!({
            "name": "Jane Doe",
            "Password": "pw",
            "contacts": [{"phone": "555", "token": "t"}]
        });
        let mut c = ctx();
        let out = RequestInterceptor::on_request(
            &interceptor,
            ConnectorRequest::post("/", body.clone()),
            &mut c,
        )
        .await
        .unwrap();

        assert_eq!(out.body, Some(body));
        let redacted = &c.metadata["redactedRequestBody"];
        assert_eq!(redacted["name"], "Jane Doe");
        assert_eq!(redacted["Password"], REDACTED);
        assert_eq!(redacted["contacts"][0]["token"], REDACTED);
        assert_eq!(redacted["contacts"][0]["phone"], "555");
    }

    #[tokio::test]
    async fn test_timing_sets_duration() {
        let response = InterceptedResponse {
            status: 200,
            headers: BTreeMap::new(),
            data: Value::Null,
            duration: None,
        };
        let mut c = ctx();
        let out = TimingInterceptor.on_response(response, &mut c).await.unwrap();
        assert!(out.duration.is_some());
        assert!(c.metadata.contains_key("responseTimeMs"));
    }

    #[tokio::test]
    async fn test_error_normalization_annotates() {
        let mut c = ctx();
        let error = ErrorNormalizationInterceptor
            .on_error(ConnectorError::new("HTTP_502", ""), &mut c)
            .await;
        assert_eq!(error.detail("correlationId"), Some("corr-1"));
        assert_eq!(error.detail("connectorId"), Some("border"));
        assert_eq!(error.message, "border request failed");
    }
}
