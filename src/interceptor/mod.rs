//! Request/response/error interceptor pipeline
//!
//! An [`InterceptorChain`] holds three independent ordered lists. Each stage
//! receives the value being transformed plus a shared [`RequestContext`] and
//! returns a new value; the chain folds the value through every interceptor
//! in registration order. Interceptors never see the transport.
//!
//! ```
//! use lifeline::interceptor::InterceptorChain;
//!
//! let chain = InterceptorChain::new();
//! chain.add_request_fn("tenant", |request, _ctx| {
//!     Ok(request.header("X-Tenant", "ops"))
//! });
//! assert_eq!(chain.counts(), (1, 0, 0));
//! ```

mod builtin;

pub use builtin::{
    ContentTypeInterceptor, CorrelationIdInterceptor, ErrorNormalizationInterceptor,
    LoggingInterceptor, RedactionInterceptor, TimingInterceptor, UserAgentInterceptor,
    CORRELATION_ID_HEADER, DEFAULT_SENSITIVE_FIELDS,
};

use crate::connector::ConnectorRequest;
use crate::error::{ConnectorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// State shared by every interceptor during one call
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    pub connector_id: String,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
    /// Free-form annotations (timings, redacted copies, ...)
    pub metadata: Map<String, Value>,
}

impl RequestContext {
    pub fn new(connector_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            connector_id: connector_id.into(),
            start_time: Instant::now(),
            started_at: Utc::now(),
            metadata: Map::new(),
        }
    }

    /// Context with a fresh random correlation id
    pub fn generate(connector_id: impl Into<String>) -> Self {
        Self::new(connector_id, Uuid::new_v4().to_string())
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Successful response as seen by response interceptors
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptedResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub data: Value,
    /// Set by the timing interceptor
    pub duration: Option<Duration>,
}

#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn on_request(
        &self,
        request: ConnectorRequest,
        ctx: &mut RequestContext,
    ) -> Result<ConnectorRequest>;
}

#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn on_response(
        &self,
        response: InterceptedResponse,
        ctx: &mut RequestContext,
    ) -> Result<InterceptedResponse>;
}

/// Error interceptors cannot fail; they only enrich or rewrite the error
#[async_trait]
pub trait ErrorInterceptor: Send + Sync {
    fn name(&self) -> &str;

    async fn on_error(&self, error: ConnectorError, ctx: &mut RequestContext) -> ConnectorError;
}

type RequestFn = dyn Fn(ConnectorRequest, &mut RequestContext) -> Result<ConnectorRequest> + Send + Sync;
type ResponseFn =
    dyn Fn(InterceptedResponse, &mut RequestContext) -> Result<InterceptedResponse> + Send + Sync;
type ErrorFn = dyn Fn(ConnectorError, &mut RequestContext) -> ConnectorError + Send + Sync;

/// Synchronous closure as a request interceptor
pub struct FnRequestInterceptor {
    name: String,
    f: Box<RequestFn>,
}

#[async_trait]
impl RequestInterceptor for FnRequestInterceptor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_request(
        &self,
        request: ConnectorRequest,
        ctx: &mut RequestContext,
    ) -> Result<ConnectorRequest> {
        (self.f)(request, ctx)
    }
}

/// Synchronous closure as a response interceptor
pub struct FnResponseInterceptor {
    name: String,
    f: Box<ResponseFn>,
}

#[async_trait]
impl ResponseInterceptor for FnResponseInterceptor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_response(
        &self,
        response: InterceptedResponse,
        ctx: &mut RequestContext,
    ) -> Result<InterceptedResponse> {
        (self.f)(response, ctx)
    }
}

/// Synchronous closure as an error interceptor
pub struct FnErrorInterceptor {
    name: String,
    f: Box<ErrorFn>,
}

#[async_trait]
impl ErrorInterceptor for FnErrorInterceptor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_error(&self, error: ConnectorError, ctx: &mut RequestContext) -> ConnectorError {
        (self.f)(error, ctx)
    }
}

/// Ordered request, response and error interceptors
#[derive(Default)]
pub struct InterceptorChain {
    request: RwLock<Vec<Arc<dyn RequestInterceptor>>>,
    response: RwLock<Vec<Arc<dyn ResponseInterceptor>>>,
    error: RwLock<Vec<Arc<dyn ErrorInterceptor>>>,
}

impl fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorChain")
            .field("request", &names(&self.request, |i| i.name().to_string()))
            .field("response", &names(&self.response, |i| i.name().to_string()))
            .field("error", &names(&self.error, |i| i.name().to_string()))
            .finish()
    }
}

fn snapshot<T: ?Sized>(list: &RwLock<Vec<Arc<T>>>) -> Vec<Arc<T>> {
    list.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

fn push<T: ?Sized>(list: &RwLock<Vec<Arc<T>>>, item: Arc<T>) {
    list.write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(item);
}

fn names<T: ?Sized>(list: &RwLock<Vec<Arc<T>>>, name: impl Fn(&T) -> String) -> Vec<String> {
    snapshot(list).iter().map(|i| name(i.as_ref())).collect()
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain with every built-in interceptor in its conventional order
    pub fn with_defaults() -> Self {
        let chain = Self::new();
        let logging = Arc::new(LoggingInterceptor);

        chain.add_request(Arc::new(CorrelationIdInterceptor::default()));
        chain.add_request(Arc::new(ContentTypeInterceptor::default()));
        chain.add_request(Arc::new(UserAgentInterceptor::default()));
        chain.add_request(Arc::new(RedactionInterceptor::default()));
        chain.add_request(logging.clone());

        chain.add_response(Arc::new(TimingInterceptor));
        chain.add_response(Arc::new(RedactionInterceptor::default()));
        chain.add_response(logging.clone());

        chain.add_error(Arc::new(ErrorNormalizationInterceptor));
        chain.add_error(logging);
        chain
    }

    pub fn add_request(&self, interceptor: Arc<dyn RequestInterceptor>) -> &Self {
        push(&self.request, interceptor);
        self
    }

    pub fn add_response(&self, interceptor: Arc<dyn ResponseInterceptor>) -> &Self {
        push(&self.response, interceptor);
        self
    }

    pub fn add_error(&self, interceptor: Arc<dyn ErrorInterceptor>) -> &Self {
        push(&self.error, interceptor);
        self
    }

    pub fn add_request_fn<F>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(ConnectorRequest, &mut RequestContext) -> Result<ConnectorRequest> + Send + Sync + 'static,
    {
        self.add_request(Arc::new(FnRequestInterceptor {
            name: name.into(),
            f: Box::new(f),
        }))
    }

    pub fn add_response_fn<F>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(InterceptedResponse, &mut RequestContext) -> Result<InterceptedResponse>
            + Send
            + Sync
            + 'static,
    {
        self.add_response(Arc::new(FnResponseInterceptor {
            name: name.into(),
            f: Box::new(f),
        }))
    }

    pub fn add_error_fn<F>(&self, name: impl Into<String>, f: F) -> &Self
    where
        F: Fn(ConnectorError, &mut RequestContext) -> ConnectorError + Send + Sync + 'static,
    {
        self.add_error(Arc::new(FnErrorInterceptor {
            name: name.into(),
            f: Box::new(f),
        }))
    }

    /// Number of (request, response, error) interceptors
    pub fn counts(&self) -> (usize, usize, usize) {
        (
            snapshot(&self.request).len(),
            snapshot(&self.response).len(),
            snapshot(&self.error).len(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.counts() == (0, 0, 0)
    }

    pub fn clear(&self) {
        self.request.write().unwrap_or_else(|p| p.into_inner()).clear();
        self.response.write().unwrap_or_else(|p| p.into_inner()).clear();
        self.error.write().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Fold a request through every request interceptor
    ///
    /// The first interceptor error aborts the fold.
    pub async fn process_request(
        &self,
        mut request: ConnectorRequest,
        ctx: &mut RequestContext,
    ) -> Result<ConnectorRequest> {
        for interceptor in snapshot(&self.request) {
            request = interceptor.on_request(request, ctx).await?;
        }
        Ok(request)
    }

    pub async fn process_response(
        &self,
        mut response: InterceptedResponse,
        ctx: &mut RequestContext,
    ) -> Result<InterceptedResponse> {
        for interceptor in snapshot(&self.response) {
            response = interceptor.on_response(response, ctx).await?;
        }
        Ok(response)
    }

    pub async fn process_error(
        &self,
        mut error: ConnectorError,
        ctx: &mut RequestContext,
    ) -> ConnectorError {
        for interceptor in snapshot(&self.error) {
            error = interceptor.on_error(error, ctx).await;
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnectError;
    use serde_json::json;

    #[tokio::test]
    async fn test_request_fold_runs_in_order() {
        let chain = InterceptorChain::new();
        chain.add_request_fn("first", |r, _| Ok(r.header("X-Order", "first")));
        chain.add_request_fn("second", |r, ctx| {
            let seen = r.header_value("X-Order").unwrap_or_default().to_string();
            ctx.metadata.insert("seen".into(), json!(seen));
            Ok(r.header("X-Order", "second"))
        });

        let mut ctx = RequestContext::generate("hospital");
        let out = chain
            .process_request(ConnectorRequest::get("/"), &mut ctx)
            .await
            .unwrap();

        assert_eq!(out.header_value("X-Order"), Some("second"));
        assert_eq!(ctx.metadata["seen"], "first");
    }

    #[tokio::test]
    async fn test_request_error_aborts() {
        let chain = InterceptorChain::new();
        chain.add_request_fn("reject", |_, _| Err(ConnectError::Config("blocked".into())));
        chain.add_request_fn("never", |_, ctx| {
            ctx.metadata.insert("ran".into(), json!(true));
            Ok(ConnectorRequest::get("/"))
        });

        let mut ctx = RequestContext::generate("x");
        let result = chain.process_request(ConnectorRequest::get("/"), &mut ctx).await;
        assert!(result.is_err());
        assert!(!ctx.metadata.contains_key("ran"));
    }

    #[tokio::test]
    async fn test_error_fold() {
        let chain = InterceptorChain::new();
        chain.add_error_fn("tag", |mut e, ctx| {
            e.details
                .insert("connector".into(), json!(ctx.connector_id.clone()));
            e
        });

        let mut ctx = RequestContext::generate("morgue");
        let error = chain
            .process_error(ConnectorError::new("HTTP_500", "boom"), &mut ctx)
            .await;
        assert_eq!(error.detail("connector"), Some("morgue"));
    }

    #[test]
    fn test_defaults_and_clear() {
        let chain = InterceptorChain::with_defaults();
        assert_eq!(chain.counts(), (5, 3, 2));
        assert!(format!("{:?}", chain).contains("correlation-id"));

        chain.clear();
        assert!(chain.is_empty());
    }
}
