//! The composed connector
//!
//! Call path of [`BaseConnector::execute`]:
//!
//! ```text
//! request interceptors -> breaker.admit -> retry(timeout(do_request)) -> breaker outcome
//!                                                                          -> response / error interceptors
//! ```
//!
//! `do_request` builds the URL, merges headers, applies auth and calls the
//! transport once. Everything that can go wrong is normalized into a
//! [`ConnectorError`] inside the returned [`ConnectorResponse`].

use super::{
    ConnectionStatus, Connector, ConnectorMetrics, ConnectorRequest, ConnectorResponse,
    HealthCheckResult, HealthStatus, ResponseMetadata,
};
use crate::auth::{create_auth_adapter, AuthAdapter, DecryptedCredential, OAuth2Auth, TokenRefreshListener};
use crate::config::{AuthSettings, ConnectorConfig};
use crate::error::{codes, ConnectError, ConnectorError, Result};
use crate::interceptor::{InterceptedResponse, InterceptorChain, RequestContext};
use crate::registries::Registries;
use crate::transport::{HttpTransport, RequestBody, Transport, TransportRequest};
use chrono::{DateTime, Utc};
use lifeline_core_resilience::{
    CircuitBreaker, CircuitState, ResponseCache, RetryExhausted, RetryHandler, SetOptions,
    TokenBucketRateLimiter,
};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Responses averaged for `average_response_time_ms`
const RESPONSE_TIME_WINDOW: usize = 100;

#[derive(Debug, Default)]
struct MetricsState {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    response_times: VecDeque<u64>,
    connected_at: Option<Instant>,
    last_request_at: Option<DateTime<Utc>>,
}

impl MetricsState {
    fn record(&mut self, success: bool, elapsed_ms: u64) {
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        if self.response_times.len() == RESPONSE_TIME_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed_ms);
    }

    fn average_response_time_ms(&self) -> f64 {
        if self.response_times.is_empty() {
            return 0.0;
        }
        self.response_times.iter().sum::<u64>() as f64 / self.response_times.len() as f64
    }
}

struct Inner {
    config: ConnectorConfig,
    base_url: Url,
    transport: Arc<dyn Transport>,
    auth: tokio::sync::RwLock<Box<dyn AuthAdapter>>,
    credential: tokio::sync::Mutex<Option<DecryptedCredential>>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryHandler,
    limiter: Option<Arc<TokenBucketRateLimiter>>,
    cache: Option<Arc<ResponseCache<Value>>>,
    interceptors: Arc<InterceptorChain>,
    status: Mutex<ConnectionStatus>,
    metrics: Mutex<MetricsState>,
}

/// Breaker + retry + auth + transport behind one `execute` call
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub struct BaseConnector {
    inner: Arc<Inner>,
}

impl fmt::Debug for BaseConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseConnector")
            .field("id", &self.inner.config.id)
            .field("base_url", &self.inner.base_url.as_str())
            .field("auth_type", &self.inner.config.auth_type())
            .field("status", &self.status())
            .finish()
    }
}

/// Builder for [`BaseConnector`]
///
/// Defaults: HTTP transport, the global [`Registries`], and an auth adapter
/// derived from the config's `auth` block.
pub struct BaseConnectorBuilder {
    config: ConnectorConfig,
    transport: Option<Arc<dyn Transport>>,
    registries: Option<Arc<Registries>>,
    interceptors: Option<InterceptorChain>,
    auth_adapter: Option<Box<dyn AuthAdapter>>,
    token_listener: Option<Arc<dyn TokenRefreshListener>>,
}

impl BaseConnectorBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn registries(mut self, registries: Arc<Registries>) -> Self {
        self.registries = Some(registries);
        self
    }

    /// Register `chain` for this connector id, replacing any existing chain
    pub fn interceptors(mut self, chain: InterceptorChain) -> Self {
        self.interceptors = Some(chain);
        self
    }

    pub fn auth_adapter(mut self, adapter: Box<dyn AuthAdapter>) -> Self {
        self.auth_adapter = Some(adapter);
        self
    }

    /// Observer for rotated OAuth2 tokens; ignored for other schemes
    pub fn token_listener(mut self, listener: Arc<dyn TokenRefreshListener>) -> Self {
        self.token_listener = Some(listener);
        self
    }

    pub fn build(self) -> Result<BaseConnector> {
        self.config.validate()?;
        let base_url = self.config.base()?;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new()?),
        };
        let registries = self.registries.unwrap_or_else(Registries::global);
        let id = self.config.id.clone();

        // Shared state built from a different config is replaced, not reused
        let breaker_config = self.config.circuit_breaker_config();
        let breaker = registries.breakers.get_or_replace(
            &id,
            |existing| existing.config() == &breaker_config,
            || CircuitBreaker::new(id.clone(), breaker_config.clone()),
        );
        let limiter = self.config.rate_limit_config().map(|config| {
            registries.limiters.get_or_replace(
                &id,
                |existing| existing.config() == &config,
                || TokenBucketRateLimiter::new(id.clone(), config.clone()),
            )
        });
        let cache = self.config.cache_config().map(|config| {
            registries.caches.get_or_replace(
                &id,
                |existing| existing.config() == &config,
                || ResponseCache::new(id.clone(), config.clone()),
            )
        });
        if let Some(chain) = self.interceptors {
            registries.interceptors.insert(id.clone(), chain);
        }
        let interceptors = registries
            .interceptors
            .get_or_create(&id, InterceptorChain::new);

        let auth = match self.auth_adapter {
            Some(adapter) => adapter,
            None => match (&self.config.auth, self.token_listener) {
                (
                    AuthSettings::OAuth2 {
                        token_url,
                        scope,
                        token_refresh_buffer_ms,
                    },
                    Some(listener),
                ) => {
                    let mut oauth = OAuth2Auth::from_settings(
                        token_url,
                        scope.clone(),
                        *token_refresh_buffer_ms,
                        Arc::clone(&transport),
                    )?;
                    oauth.set_listener(listener);
                    Box::new(oauth)
                }
                (settings, _) => create_auth_adapter(settings, Arc::clone(&transport))?,
            },
        };

        debug!(
            connector_id = %id,
            base_url = %base_url,
            auth_type = %self.config.auth_type(),
            rate_limited = limiter.is_some(),
            cached = cache.is_some(),
            "Connector built"
        );

        Ok(BaseConnector {
            inner: Arc::new(Inner {
                retry: RetryHandler::new(self.config.retry_policy()),
                config: self.config,
                base_url,
                transport,
                auth: tokio::sync::RwLock::new(auth),
                credential: tokio::sync::Mutex::new(None),
                breaker,
                limiter,
                cache,
                interceptors,
                status: Mutex::new(ConnectionStatus::Disconnected),
                metrics: Mutex::new(MetricsState::default()),
            }),
        })
    }
}

impl BaseConnector {
    pub fn builder(config: ConnectorConfig) -> BaseConnectorBuilder {
        BaseConnectorBuilder {
            config,
            transport: None,
            registries: None,
            interceptors: None,
            auth_adapter: None,
            token_listener: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.inner.config
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.breaker
    }

    pub fn rate_limiter(&self) -> Option<&Arc<TokenBucketRateLimiter>> {
        self.inner.limiter.as_ref()
    }

    pub fn cache(&self) -> Option<&Arc<ResponseCache<Value>>> {
        self.inner.cache.as_ref()
    }

    pub fn interceptors(&self) -> &Arc<InterceptorChain> {
        &self.inner.interceptors
    }

    pub fn status(&self) -> ConnectionStatus {
        *self
            .inner
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self
            .inner
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }

    fn metrics_state(&self) -> MutexGuard<'_, MetricsState> {
        self.inner
            .metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand over credentials from the vault
    ///
    /// Applied on the next `connect()`, or immediately when already connected.
    pub async fn set_credentials(&self, credential: DecryptedCredential) -> Result<()> {
        *self.inner.credential.lock().await = Some(credential);
        if self.status() == ConnectionStatus::Connected {
            self.configure_auth().await?;
        }
        Ok(())
    }

    /// Forget stored credentials and wipe the auth adapter
    pub async fn clear_credentials(&self) {
        *self.inner.credential.lock().await = None;
        self.inner.auth.write().await.clear();
    }

    async fn configure_auth(&self) -> Result<()> {
        let credential = self.inner.credential.lock().await;
        let mut auth = self.inner.auth.write().await;
        match credential.as_ref() {
            Some(credential) => auth.configure(credential),
            None if auth.is_configured() => Ok(()),
            None => Err(ConnectError::Auth(format!(
                "no {} credentials set for connector '{}'",
                auth.auth_type(),
                self.id()
            ))),
        }
    }

    /// Configure auth and probe the service; `Connected` only on success
    pub async fn connect(&self) -> Result<()> {
        self.set_status(ConnectionStatus::Connecting);

        if let Err(e) = self.configure_auth().await {
            self.set_status(ConnectionStatus::Error);
            warn!(connector_id = %self.id(), error = %e, "Connector auth configuration failed");
            return Err(e);
        }

        let health = self.health_check().await;
        if health.healthy {
            self.set_status(ConnectionStatus::Connected);
            self.metrics_state().connected_at = Some(Instant::now());
            info!(
                connector_id = %self.id(),
                response_time_ms = health.response_time_ms,
                "Connector connected"
            );
            Ok(())
        } else {
            self.set_status(ConnectionStatus::Error);
            let message = health
                .message
                .unwrap_or_else(|| "health check failed".to_string());
            warn!(connector_id = %self.id(), reason = %message, "Connector failed to connect");
            Err(ConnectError::Coded {
                code: codes::HEALTH_CHECK_FAILED.to_string(),
                message,
                status_code: None,
            })
        }
    }

    pub async fn disconnect(&self) {
        self.set_status(ConnectionStatus::Disconnected);
        self.metrics_state().connected_at = None;
        info!(connector_id = %self.id(), "Connector disconnected");
    }

    /// Probe `health_check_path` through the full `execute` pipeline
    pub async fn health_check(&self) -> HealthCheckResult {
        let request = ConnectorRequest::get(self.inner.config.health_check_path.clone());
        let response = self.execute(request).await;
        let breaker_state = response.metadata.circuit_breaker_state;

        let status = if !response.success {
            HealthStatus::Unhealthy
        } else if breaker_state == CircuitState::Closed {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };

        HealthCheckResult {
            connector_id: self.id().to_string(),
            healthy: response.success,
            status,
            response_time_ms: response.metadata.response_time_ms,
            message: response.error.map(|e| e.message),
            circuit_breaker_state: breaker_state,
            checked_at: Utc::now(),
        }
    }

    pub async fn metrics(&self) -> ConnectorMetrics {
        let breaker = self.inner.breaker.stats().await;
        let metrics = self.metrics_state();
        ConnectorMetrics {
            connector_id: self.id().to_string(),
            total_requests: metrics.total_requests,
            successful_requests: metrics.successful_requests,
            failed_requests: metrics.failed_requests,
            average_response_time_ms: metrics.average_response_time_ms(),
            circuit_breaker_trips: breaker.total_trips,
            circuit_breaker_state: breaker.state,
            uptime_ms: metrics
                .connected_at
                .map(|at| at.elapsed().as_millis() as u64)
                .unwrap_or(0),
            last_request_at: metrics.last_request_at,
        }
    }

    /// Run one call through the full pipeline; never fails outright
    pub async fn execute(&self, request: ConnectorRequest) -> ConnectorResponse<Value> {
        self.execute_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Like [`execute`](Self::execute), aborting the in-flight attempt and any
    /// backoff sleep as soon as `cancel` fires
    pub async fn execute_with_cancel(
        &self,
        request: ConnectorRequest,
        cancel: CancellationToken,
    ) -> ConnectorResponse<Value> {
        let started = Instant::now();
        let request_id = request.id.clone();
        {
            let mut metrics = self.metrics_state();
            metrics.total_requests += 1;
            metrics.last_request_at = Some(Utc::now());
        }

        let mut ctx = RequestContext::new(self.id(), request_id.clone());
        let attempts = AtomicU32::new(0);
        let outcome = self.run(request, &mut ctx, &cancel, &attempts).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let retry_count = attempts.load(Ordering::Relaxed).saturating_sub(1);
        let circuit_breaker_state = self.inner.breaker.state().await;
        self.metrics_state().record(outcome.is_ok(), elapsed_ms);

        match outcome {
            Ok(response) => ConnectorResponse::ok(
                response.data,
                ResponseMetadata {
                    request_id,
                    status_code: Some(response.status),
                    response_time_ms: elapsed_ms,
                    retry_count,
                    circuit_breaker_state,
                    cached: false,
                    stale: false,
                },
            ),
            Err(error) => {
                let status_code = error.http_status();
                let normalized = self.normalize_error(&error, &mut ctx).await;
                ConnectorResponse::err(
                    normalized,
                    ResponseMetadata {
                        request_id,
                        status_code,
                        response_time_ms: elapsed_ms,
                        retry_count,
                        circuit_breaker_state,
                        cached: false,
                        stale: false,
                    },
                )
            }
        }
    }

    async fn run(
        &self,
        request: ConnectorRequest,
        ctx: &mut RequestContext,
        cancel: &CancellationToken,
        attempts: &AtomicU32,
    ) -> Result<InterceptedResponse> {
        let request = self.inner.interceptors.process_request(request, ctx).await?;

        // Dropping `permit` before an outcome is recorded frees its trial slot
        let Some(permit) = self.inner.breaker.admit().await else {
            debug!(connector_id = %self.id(), path = %request.path, "Circuit open, request rejected");
            return Err(ConnectError::CircuitOpen {
                connector_id: self.id().to_string(),
            });
        };

        let timeout = request.timeout.unwrap_or_else(|| self.inner.config.timeout());
        let this = self;
        let request_ref = &request;
        let retry = self.inner.retry.execute_with_timeout(
            move || {
                attempts.fetch_add(1, Ordering::Relaxed);
                this.do_request(request_ref.clone(), timeout, cancel)
            },
            timeout,
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            result = retry => result.map_err(|e| self.classify_exhausted(e)),
        };

        match &result {
            Ok(_) => permit.record_success().await,
            Err(ConnectError::Cancelled) => drop(permit),
            Err(_) => permit.record_failure().await,
        }

        let response = result?;
        self.inner.interceptors.process_response(response, ctx).await
    }

    /// Surface `RETRY_EXHAUSTED` only when retries were actually the reason
    /// the call gave up; a non-retryable failure keeps its own identity
    fn classify_exhausted(&self, exhausted: RetryExhausted<ConnectError>) -> ConnectError {
        if self.inner.retry.is_retryable(&exhausted.last_error) {
            exhausted.into()
        } else {
            exhausted.last_error
        }
    }

    async fn normalize_error(&self, error: &ConnectError, ctx: &mut RequestContext) -> ConnectorError {
        let retryable = self.inner.retry.is_retryable(error.root());
        let mut normalized = error.to_connector_error(retryable);
        if let ConnectError::RetryExhausted {
            attempts, delays, ..
        } = error
        {
            normalized
                .details
                .insert("attempts".to_string(), Value::from(*attempts));
            normalized.details.insert(
                "delaysMs".to_string(),
                Value::from(
                    delays
                        .iter()
                        .map(|d| d.as_millis() as u64)
                        .collect::<Vec<_>>(),
                ),
            );
            normalized
                .details
                .insert("lastErrorCode".to_string(), Value::from(error.root().code()));
        }
        self.inner.interceptors.process_error(normalized, ctx).await
    }

    /// One attempt: build URL, merge headers, authenticate, send, decode
    pub async fn do_request(
        &self,
        request: ConnectorRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<InterceptedResponse> {
        let url = self.build_url(&request)?;
        let mut outgoing = TransportRequest::new(request.method, url);
        outgoing.timeout = Some(timeout);
        for (name, value) in self.inner.config.default_headers.iter().chain(&request.headers) {
            set_header(&mut outgoing.headers, name, value);
        }
        outgoing.body = request.body.map(RequestBody::Json);

        let outgoing = {
            let auth = self.inner.auth.read().await;
            auth.apply_to_request(outgoing).await?
        };

        let response = self.inner.transport.send(outgoing, cancel).await?;
        if !response.is_success() {
            let body = response.text();
            return Err(ConnectError::Http {
                status: response.status,
                message: format!("{} {}", response.status, response.status_text()),
                body: (!body.is_empty()).then_some(body),
            });
        }

        let data = response.decode()?;
        Ok(InterceptedResponse {
            status: response.status,
            headers: response.headers,
            data,
            duration: None,
        })
    }

    /// Base URL joined with the request path, without query parameters
    fn resolve_path(&self, request: &ConnectorRequest) -> Result<Url> {
        let base = self.inner.base_url.as_str().trim_end_matches('/');
        let path = request.path.trim_start_matches('/');
        let joined = if path.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, path)
        };
        Url::parse(&joined).map_err(|e| {
            ConnectError::Config(format!("invalid request path '{}': {}", request.path, e))
        })
    }

    fn build_url(&self, request: &ConnectorRequest) -> Result<Url> {
        let mut url = self.resolve_path(request)?;
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &request.query {
                pairs.append_pair(name, value);
            }
        }
        Ok(url)
    }

    /// `execute` behind the connector's rate limiter, when it has one
    pub async fn execute_limited(&self, request: ConnectorRequest) -> ConnectorResponse<Value> {
        self.execute_limited_with_cancel(request, CancellationToken::new())
            .await
    }

    /// [`execute_limited`](Self::execute_limited) with cancellation; a caller
    /// still waiting in the limiter queue gives up its place when `cancel` fires
    pub async fn execute_limited_with_cancel(
        &self,
        request: ConnectorRequest,
        cancel: CancellationToken,
    ) -> ConnectorResponse<Value> {
        let Some(limiter) = &self.inner.limiter else {
            return self.execute_with_cancel(request, cancel).await;
        };

        let started = Instant::now();
        let request_id = request.id.clone();
        let call_cancel = cancel.clone();
        let limited = tokio::select! {
            // An admitted call observes `cancel` itself and reports through its response
            biased;
            limited = limiter.execute(move || async move {
                Ok::<_, ConnectError>(self.execute_with_cancel(request, call_cancel).await)
            }) => limited,
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
        };

        match limited {
            Ok(response) => response,
            Err(throttled) => {
                debug!(connector_id = %self.id(), error = %throttled, "Request not admitted by rate limiter");
                let mut ctx = RequestContext::new(self.id(), request_id.clone());
                let normalized = self.normalize_error(&throttled, &mut ctx).await;
                ConnectorResponse::err(
                    normalized,
                    ResponseMetadata {
                        request_id,
                        status_code: None,
                        response_time_ms: started.elapsed().as_millis() as u64,
                        retry_count: 0,
                        circuit_breaker_state: self.inner.breaker.state().await,
                        cached: false,
                        stale: false,
                    },
                )
            }
        }
    }

    /// Rate limiter and response cache composed around `execute`
    ///
    /// Idempotent reads are served from the connector's cache (stale entries
    /// trigger one background refresh). Successful writes invalidate cached
    /// entries tagged with the request's first path segment.
    pub async fn execute_managed(&self, request: ConnectorRequest) -> ConnectorResponse<Value> {
        self.execute_managed_with_cancel(request, CancellationToken::new())
            .await
    }

    /// [`execute_managed`](Self::execute_managed) with cancellation
    ///
    /// A background refresh of a stale entry is not tied to `cancel`; a
    /// cache miss being fetched inline is abandoned when `cancel` fires.
    pub async fn execute_managed_with_cancel(
        &self,
        request: ConnectorRequest,
        cancel: CancellationToken,
    ) -> ConnectorResponse<Value> {
        let Some(cache) = self.inner.cache.clone() else {
            return self.execute_limited_with_cancel(request, cancel).await;
        };

        let resource = request.resource().to_string();
        if !request.method.is_idempotent_read() {
            let response = self.execute_limited_with_cancel(request, cancel).await;
            if response.success && !resource.is_empty() {
                let removed = cache.invalidate_by_tag(&resource);
                debug!(connector_id = %self.id(), tag = %resource, removed, "Cache invalidated after write");
            }
            return response;
        }

        let key = match self.resolve_path(&request) {
            Ok(url) => {
                ResponseCache::<Value>::generate_key(request.method.as_str(), url.as_str(), &request.query)
            }
            Err(_) => return self.execute_limited_with_cancel(request, cancel).await,
        };

        let started = Instant::now();
        let request_id = request.id.clone();
        let slot: Arc<Mutex<Option<ConnectorResponse<Value>>>> = Arc::default();
        let fetch = {
            let this = self.clone();
            let slot = Arc::clone(&slot);
            move || async move {
                let response = this.execute_limited(request).await;
                let result = match (&response.data, &response.error) {
                    (_, Some(error)) => Err(error.clone()),
                    (data, None) => Ok(data.clone().unwrap_or(Value::Null)),
                };
                *slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(response);
                result
            }
        };
        let options = if resource.is_empty() {
            SetOptions::default()
        } else {
            SetOptions::tagged([resource])
        };

        // A stale hit has already spawned its refresh by the time it resolves
        let outcome = tokio::select! {
            biased;
            outcome = cache.get_or_fetch(&key, options, fetch) => outcome,
            _ = cancel.cancelled() => Err(ConnectError::Cancelled.to_connector_error(false)),
        };
        let fetched = take_slot(&slot);

        match outcome {
            Ok(hit) => {
                if let (false, Some(response)) = (hit.stale, fetched) {
                    return response;
                }
                ConnectorResponse::ok(
                    hit.data,
                    ResponseMetadata {
                        request_id,
                        status_code: None,
                        response_time_ms: started.elapsed().as_millis() as u64,
                        retry_count: 0,
                        circuit_breaker_state: self.inner.breaker.state().await,
                        cached: true,
                        stale: hit.stale,
                    },
                )
            }
            Err(error) => match fetched {
                Some(response) => response,
                None => ConnectorResponse::err(
                    error,
                    ResponseMetadata {
                        request_id,
                        status_code: None,
                        response_time_ms: started.elapsed().as_millis() as u64,
                        retry_count: 0,
                        circuit_breaker_state: self.inner.breaker.state().await,
                        cached: false,
                        stale: false,
                    },
                ),
            },
        }
    }
}

fn take_slot(slot: &Mutex<Option<ConnectorResponse<Value>>>) -> Option<ConnectorResponse<Value>> {
    slot.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take()
}

/// Insert a header, replacing any existing spelling of the same name
fn set_header(headers: &mut BTreeMap<String, String>, name: &str, value: &str) {
    headers.retain(|existing, _| !existing.eq_ignore_ascii_case(name));
    headers.insert(name.to_string(), value.to_string());
}

impl Connector for BaseConnector {
    fn base(&self) -> &BaseConnector {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthType;
    use crate::config::{ApiKeyLocation, CacheSettings, RateLimitSettings};
    use crate::connector::ConnectorExt;
    use crate::transport::{MockRoute, MockTransport};
    use serde::Deserialize;
    use serde_json::json;

    fn config() -> ConnectorConfig {
        let mut config = ConnectorConfig::new("hospital", "Hospital Registry", "https://registry.example/api");
        config.timeout_ms = 1_000;
        config.retry_policy.base_delay_ms = 10;
        config.retry_policy.max_delay_ms = 50;
        config.retry_policy.jitter_enabled = false;
        config.circuit_breaker.failure_threshold = 2;
        config
    }

    fn connector(config: ConnectorConfig, mock: &MockTransport) -> BaseConnector {
        BaseConnector::builder(config)
            .transport(Arc::new(mock.clone()))
            .registries(Arc::new(Registries::new()))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_builds_url_and_metadata() {
        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/patients").json(json!([{"id": 1}])));
        let connector = connector(config(), &mock);

        let response = connector
            .execute(ConnectorRequest::get("/patients").query("ward", "3"))
            .await;

        assert!(response.success);
        assert_eq!(response.data, Some(json!([{"id": 1}])));
        assert_eq!(response.metadata.status_code, Some(200));
        assert_eq!(response.metadata.retry_count, 0);
        assert_eq!(response.metadata.circuit_breaker_state, CircuitState::Closed);
        assert_eq!(mock.requests()[0].query_param("ward"), Some("3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/status").status(503).times(2));
        mock.route(MockRoute::get("/api/status").json(json!({"ok": true})));
        let connector = connector(config(), &mock);

        let response = connector.execute(ConnectorRequest::get("/status")).await;
        assert!(response.success);
        assert_eq!(response.metadata.retry_count, 2);
        assert_eq!(mock.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_normalized() {
        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/status").status(502));
        let connector = connector(config(), &mock);

        let response = connector.execute(ConnectorRequest::get("/status")).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, "RETRY_EXHAUSTED");
        assert_eq!(error.status_code, Some(502));
        assert!(error.retryable);
        assert_eq!(error.details["attempts"], 3);
        assert_eq!(error.details["lastErrorCode"], "HTTP_502");
    }

    #[tokio::test]
    async fn test_non_retryable_keeps_status_code() {
        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/missing").status(404).text("no such case"));
        let connector = connector(config(), &mock);

        let response = connector.execute(ConnectorRequest::get("/missing")).await;
        let error = response.error.unwrap();
        assert_eq!(error.code, "HTTP_404");
        assert!(!error.retryable);
        assert_eq!(mock.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_and_short_circuits() {
        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/status").status(500));
        let mut config = config();
        config.retry_policy.max_attempts = 1;
        let connector = connector(config, &mock);

        connector.execute(ConnectorRequest::get("/status")).await;
        connector.execute(ConnectorRequest::get("/status")).await;
        assert_eq!(connector.circuit_breaker().state().await, CircuitState::Open);

        let response = connector.execute(ConnectorRequest::get("/status")).await;
        assert_eq!(response.error_code(), Some("CIRCUIT_BREAKER_OPEN"));
        assert_eq!(mock.request_count(), 2);

        let metrics = connector.metrics().await;
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.failed_requests, 3);
        assert_eq!(metrics.circuit_breaker_trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retried() {
        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/slow").delay(Duration::from_secs(5)).times(1));
        mock.route(MockRoute::get("/api/slow").json(json!("fast")));
        let connector = connector(config(), &mock);

        let response = connector.execute(ConnectorRequest::get("/slow")).await;
        assert!(response.success);
        assert_eq!(response.metadata.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation() {
        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/slow").delay(Duration::from_secs(60)));
        let mut config = config();
        config.timeout_ms = 120_000;
        let connector = connector(config, &mock);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let response = connector
            .execute_with_cancel(ConnectorRequest::get("/slow"), cancel)
            .await;
        assert_eq!(response.error_code(), Some("REQUEST_CANCELLED"));
        // Cancellation says nothing about the dependency
        assert_eq!(connector.circuit_breaker().failure_count().await, 0);
    }

    #[tokio::test]
    async fn test_auth_and_default_headers() {
        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/health"));
        let mut config = config();
        config.auth = AuthSettings::ApiKey {
            location: ApiKeyLocation::Header,
            name: "X-API-Key".into(),
            prefix: None,
        };
        config
            .default_headers
            .insert("Accept".into(), "application/json".into());
        let connector = connector(config, &mock);

        assert!(connector.connect().await.is_err());
        assert_eq!(connector.status(), ConnectionStatus::Error);

        connector
            .set_credentials(DecryptedCredential::new(AuthType::ApiKey).with("api_key", "k-1"))
            .await
            .unwrap();
        connector.connect().await.unwrap();
        assert_eq!(connector.status(), ConnectionStatus::Connected);

        connector
            .execute(ConnectorRequest::get("/health").header("accept", "text/plain"))
            .await;
        let last = mock.requests().pop().unwrap();
        assert_eq!(last.header("x-api-key"), Some("k-1"));
        assert_eq!(last.header("Accept"), Some("text/plain"));
        assert_eq!(last.headers.len(), 2);

        connector.disconnect().await;
        assert_eq!(connector.status(), ConnectionStatus::Disconnected);
        assert_eq!(connector.metrics().await.uptime_ms, 0);
    }

    #[tokio::test]
    async fn test_health_check_reports_failure() {
        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/health").status(401));
        let connector = connector(config(), &mock);

        let health = connector.health_check().await;
        assert!(!health.healthy);
        assert_eq!(health.status, HealthStatus::Unhealthy);
        assert!(health.message.unwrap().contains("401"));
        assert!(connector.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_interceptors_run_around_call() {
        let mock = MockTransport::new();
        mock.route(MockRoute::post("/api/cases").status(422));
        let chain = InterceptorChain::with_defaults();
        let connector = BaseConnector::builder(config())
            .transport(Arc::new(mock.clone()))
            .registries(Arc::new(Registries::new()))
            .interceptors(chain)
            .build()
            .unwrap();

        let request = ConnectorRequest::post("/cases", json!({"name": "x"})).with_id("corr-9");
        let response = connector.execute(request).await;

        let recorded = &mock.requests()[0];
        assert_eq!(recorded.header("x-correlation-id"), Some("corr-9"));
        assert_eq!(recorded.header("content-type"), Some("application/json"));
        let error = response.error.unwrap();
        assert_eq!(error.detail("correlationId"), Some("corr-9"));
        assert_eq!(error.detail("connectorId"), Some("hospital"));
    }

    #[tokio::test]
    async fn test_execute_as_typed() {
        #[derive(Deserialize)]
        struct Case {
            id: u32,
        }

        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/cases/7").json(json!({"id": 7})));
        let connector = connector(config(), &mock);

        let response = connector
            .execute_as::<Case>(ConnectorRequest::get("/cases/7"))
            .await;
        assert_eq!(response.data.map(|c| c.id), Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_managed_caches_reads_and_invalidates_on_write() {
        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/cases").json(json!(["a"])));
        mock.route(MockRoute::post("/api/cases").status(201));
        let mut config = config();
        config.cache = Some(CacheSettings::default());
        let connector = connector(config, &mock);

        let first = connector.execute_managed(ConnectorRequest::get("/cases")).await;
        assert!(!first.metadata.cached);
        let second = connector.execute_managed(ConnectorRequest::get("/cases")).await;
        assert!(second.metadata.cached);
        assert_eq!(second.data, Some(json!(["a"])));
        assert_eq!(mock.requests_to("/api/cases").len(), 1);

        connector
            .execute_managed(ConnectorRequest::post("/cases", json!({})))
            .await;
        assert!(connector.cache().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_managed_throttles_without_queueing() {
        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/cases").json(json!([])));
        let mut config = config();
        config.rate_limit = Some(RateLimitSettings {
            max_requests_per_second: 1.0,
            max_concurrent_requests: None,
            bucket_size: Some(1.0),
            enable_queueing: false,
            max_queue_size: 0,
            queue_timeout_ms: 0,
        });
        let connector = connector(config, &mock);

        assert!(connector.execute_managed(ConnectorRequest::get("/cases")).await.success);
        let throttled = connector.execute_managed(ConnectorRequest::get("/cases")).await;
        assert_eq!(throttled.error_code(), Some("RATE_LIMIT_EXCEEDED"));
        assert_eq!(mock.request_count(), 1);
    }

    fn limited(config: &mut ConnectorConfig, enable_queueing: bool) {
        config.timeout_ms = 120_000;
        config.rate_limit = Some(RateLimitSettings {
            max_requests_per_second: 100.0,
            max_concurrent_requests: Some(1),
            bucket_size: None,
            enable_queueing,
            max_queue_size: 10,
            queue_timeout_ms: 5_000,
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_half_open_trial_does_not_wedge_breaker() {
        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/status").status(500).times(1));
        mock.route(MockRoute::get("/api/status").delay(Duration::from_secs(60)).times(1));
        mock.route(MockRoute::get("/api/status").json(json!({"ok": true})));
        let mut config = config();
        config.timeout_ms = 120_000;
        config.retry_policy.max_attempts = 1;
        config.circuit_breaker.failure_threshold = 1;
        config.circuit_breaker.success_threshold = 1;
        config.circuit_breaker.timeout_ms = 50;
        config.circuit_breaker.half_open_max_attempts = 1;
        let connector = connector(config, &mock);

        connector.execute(ConnectorRequest::get("/status")).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            connector.execute(ConnectorRequest::get("/status")),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(connector.circuit_breaker().state().await, CircuitState::HalfOpen);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let response = connector.execute(ConnectorRequest::get("/status")).await;
        assert!(response.success);
        assert_eq!(connector.circuit_breaker().state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_limited_call_returns_its_slot() {
        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/slow").delay(Duration::from_secs(60)).times(1));
        mock.route(MockRoute::get("/api/slow").json(json!("done")));
        let mut config = config();
        limited(&mut config, false);
        let connector = connector(config, &mock);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            connector.execute_limited(ConnectorRequest::get("/slow")),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(connector.rate_limiter().unwrap().metrics().current_concurrency, 0);

        let response = connector.execute_limited(ConnectorRequest::get("/slow")).await;
        assert_eq!(response.data, Some(json!("done")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_queued_behind_rate_limiter() {
        let mock = MockTransport::new();
        mock.route(MockRoute::get("/api/slow").delay(Duration::from_secs(60)));
        let mut config = config();
        limited(&mut config, true);
        let connector = connector(config, &mock);

        let busy = {
            let connector = connector.clone();
            tokio::spawn(async move { connector.execute_managed(ConnectorRequest::get("/slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let response = connector
            .execute_managed_with_cancel(ConnectorRequest::get("/slow"), cancel)
            .await;
        assert_eq!(response.error_code(), Some("REQUEST_CANCELLED"));
        assert_eq!(mock.request_count(), 1);

        busy.abort();
    }

    #[tokio::test]
    async fn test_changed_config_replaces_shared_breaker() {
        let mock = MockTransport::new();
        let registries = Arc::new(Registries::new());
        let build = |config: ConnectorConfig| {
            BaseConnector::builder(config)
                .transport(Arc::new(mock.clone()))
                .registries(Arc::clone(&registries))
                .build()
                .unwrap()
        };

        let a = build(config());
        let b = build(config());
        assert!(Arc::ptr_eq(a.circuit_breaker(), b.circuit_breaker()));

        let mut changed = config();
        changed.circuit_breaker.failure_threshold = 7;
        let c = build(changed);
        assert!(!Arc::ptr_eq(a.circuit_breaker(), c.circuit_breaker()));
        assert_eq!(c.circuit_breaker().config().failure_threshold, 7);
        let shared = registries.breakers.get("hospital").unwrap();
        assert!(Arc::ptr_eq(c.circuit_breaker(), &shared));
    }
}
