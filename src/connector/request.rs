use crate::transport::HttpMethod;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// One call to an external service, relative to the connector's base URL
///
/// Pipeline stages take a request by value and hand back a new one; nothing
/// mutates a request another stage still holds.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorRequest {
    /// Correlation id, unique per request
    pub id: String,
    pub method: HttpMethod,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    /// Query parameters in insertion order
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Overrides the connector's per-attempt timeout
    pub timeout: Option<Duration>,
}

impl ConnectorRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            path: path.into(),
            headers: BTreeMap::new(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, path).json(body)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Case-insensitive header lookup
    pub fn header_value(&self, name: &str) -> Option<&str> {
        crate::transport::find_header(&self.headers, name)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header_value(name).is_some()
    }

    /// First path segment, used as the cache tag for this resource family
    pub fn resource(&self) -> &str {
        self.path
            .trim_start_matches('/')
            .split(['/', '?'])
            .next()
            .unwrap_or_default()
    }
}
