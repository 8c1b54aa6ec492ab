//! In-memory transport for tests and offline development
//!
//! Routes are matched in registration order by method and path. A route with
//! a `times` budget stops matching once it has been used up, so a later route
//! for the same method and path takes over.
//!
//! ```
//! use lifeline::transport::{HttpMethod, MockRoute, MockTransport};
//! use serde_json::json;
//!
//! let mock = MockTransport::new();
//! mock.route(MockRoute::get("/cases/42").status(503).times(1));
//! mock.route(MockRoute::get("/cases/42").json(json!({"id": 42})));
//! assert_eq!(mock.route_count(), 2);
//! ```

use super::{HttpMethod, RequestBody, Transport, TransportRequest, TransportResponse};
use crate::error::{ConnectError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Canned response for one method + path
#[derive(Debug, Clone)]
pub struct MockRoute {
    method: HttpMethod,
    path: String,
    times: Option<usize>,
    status: u16,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
    delay: Option<Duration>,
    error: Option<(String, String)>,
}

impl MockRoute {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            times: None,
            status: 200,
            headers: BTreeMap::new(),
            body: Vec::new(),
            delay: None,
            error: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    /// Match at most `n` requests
    pub fn times(mut self, n: usize) -> Self {
        self.times = Some(n);
        self
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.headers
            .insert("content-type".to_string(), "application/json".to_string());
        self.body = value.to_string().into_bytes();
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.headers
            .insert("content-type".to_string(), "text/plain".to_string());
        self.body = text.into().into_bytes();
        self
    }

    /// Sleep before responding; cancellation and timeouts apply during the sleep
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail at the transport level with an errno-style code
    pub fn error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some((code.into(), message.into()));
        self
    }

    fn matches(&self, method: HttpMethod, path: &str) -> bool {
        self.method == method && self.path == path && self.times != Some(0)
    }

    fn response(&self) -> TransportResponse {
        TransportResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// A request as seen by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<RequestBody>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        super::find_header(&self.headers, name)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Default)]
struct MockState {
    routes: Vec<MockRoute>,
    requests: Vec<RecordedRequest>,
}

/// Transport serving canned responses; clones share routes and history
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn route(&self, route: MockRoute) -> &Self {
        self.lock().routes.push(route);
        self
    }

    /// Routes that can still match
    pub fn route_count(&self) -> usize {
        self.lock().routes.iter().filter(|r| r.times != Some(0)).count()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Requests received for one path
    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.routes.clear();
        state.requests.clear();
    }

    /// Record the request and claim the first matching route
    fn dispatch(&self, request: &TransportRequest) -> Option<MockRoute> {
        let path = request.url.path().to_string();
        let mut state = self.lock();
        state.requests.push(RecordedRequest {
            method: request.method,
            path: path.clone(),
            query: request
                .url
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        });

        let route = state
            .routes
            .iter_mut()
            .find(|r| r.matches(request.method, &path))?;
        if let Some(remaining) = route.times.as_mut() {
            *remaining -= 1;
        }
        Some(route.clone())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse> {
        if cancel.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }

        let Some(route) = self.dispatch(&request) else {
            debug!(method = %request.method, path = request.url.path(), "No mock route matched");
            let mut response = TransportResponse::new(404);
            response
                .headers
                .insert("content-type".to_string(), "application/json".to_string());
            response.body = serde_json::json!({
                "error": format!("No mock route for {} {}", request.method, request.url.path()),
            })
            .to_string()
            .into_bytes();
            return Ok(response);
        };

        if let Some(delay) = route.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        match route.error {
            Some((code, message)) => Err(ConnectError::transport(code, message)),
            None => Ok(route.response()),
        }
    }
}
