//! reqwest-backed transport

use super::{RequestBody, Transport, TransportRequest, TransportResponse};
use crate::error::{codes, ConnectError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// HTTP transport over a shared `reqwest::Client`
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lifeline/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConnectError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wrap an existing client, e.g. one with custom proxy or TLS roots
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn build(&self, request: TransportRequest) -> reqwest::RequestBuilder {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut builder = self.client.request(method, request.url);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        match request.body {
            Some(RequestBody::Json(value)) => builder.json(&value),
            Some(RequestBody::Form(pairs)) => builder.form(&pairs),
            Some(RequestBody::Text(text)) => builder.body(text),
            None => builder,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: TransportRequest,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse> {
        debug!(method = %request.method, url = %request.url, "Sending HTTP request");
        let builder = self.build(request);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            result = builder.send() => result.map_err(map_reqwest_error)?,
        };

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();

        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            result = response.bytes() => result.map_err(map_reqwest_error)?,
        };

        Ok(TransportResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

/// Map reqwest failures onto errno-style codes understood by retry policies
fn map_reqwest_error(err: reqwest::Error) -> ConnectError {
    let code = if err.is_timeout() {
        codes::TIMEOUT
    } else if err.is_connect() {
        "ECONNREFUSED"
    } else if err.is_decode() {
        return ConnectError::Decode(err.to_string());
    } else {
        codes::NETWORK_ERROR
    };
    ConnectError::transport(code, err.to_string())
}
