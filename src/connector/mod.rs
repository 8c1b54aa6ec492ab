//! Connectors: one unit of integration per external service
//!
//! [`BaseConnector`] composes the circuit breaker, retry handler, auth adapter
//! and transport behind a single `execute` call that never fails outright;
//! every outcome comes back as a [`ConnectorResponse`]. Domain connectors
//! (hospital registries, border services, ...) wrap a `BaseConnector` and
//! implement [`Connector`] by returning it from [`Connector::base`]; every
//! other method has a default that delegates to it.

mod base;
mod request;
mod response;

pub use base::{BaseConnector, BaseConnectorBuilder};
pub use request::ConnectorRequest;
pub use response::{ConnectorResponse, ResponseMetadata};

use crate::auth::DecryptedCredential;
use crate::config::ConnectorConfig;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lifeline_core_resilience::CircuitState;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle state of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        })
    }
}

/// Outcome class of a health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Probe succeeded but the breaker is still recovering
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub connector_id: String,
    pub healthy: bool,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub circuit_breaker_state: CircuitState,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorMetrics {
    pub connector_id: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Mean over the last 100 responses
    pub average_response_time_ms: f64,
    pub circuit_breaker_trips: u64,
    pub circuit_breaker_state: CircuitState,
    /// Time since the last successful `connect()`, zero when not connected
    pub uptime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_request_at: Option<DateTime<Utc>>,
}

/// Inbound contract shared by every connector
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// The composed connector this one is built on
    fn base(&self) -> &BaseConnector;

    fn id(&self) -> &str {
        &self.base().config().id
    }

    fn name(&self) -> &str {
        &self.base().config().name
    }

    fn config(&self) -> &ConnectorConfig {
        self.base().config()
    }

    async fn status(&self) -> ConnectionStatus {
        self.base().status()
    }

    async fn set_credentials(&self, credential: DecryptedCredential) -> Result<()> {
        self.base().set_credentials(credential).await
    }

    async fn connect(&self) -> Result<()> {
        self.base().connect().await
    }

    async fn disconnect(&self) {
        self.base().disconnect().await
    }

    async fn health_check(&self) -> HealthCheckResult {
        self.base().health_check().await
    }

    async fn metrics(&self) -> ConnectorMetrics {
        self.base().metrics().await
    }

    async fn execute(&self, request: ConnectorRequest) -> ConnectorResponse<Value> {
        self.base().execute(request).await
    }
}

/// Typed responses on top of any [`Connector`]
#[async_trait]
pub trait ConnectorExt: Connector {
    /// Execute and deserialize the response data into `T`
    async fn execute_as<T>(&self, request: ConnectorRequest) -> ConnectorResponse<T>
    where
        T: DeserializeOwned + Send,
    {
        self.execute(request).await.try_map(serde_json::from_value)
    }
}

impl<C: Connector + ?Sized> ConnectorExt for C {}
