/*!
 * Lifeline - resilient connectors for external case-data services
 *
 * Each external service (hospital registries, border agencies, transit
 * operators, ...) gets a connector that wraps its calls in:
 * - A circuit breaker shared by every caller of the same connector id
 * - Retry with exponential backoff and per-attempt timeouts
 * - Pluggable authentication (API key, Basic, OAuth2 client credentials)
 * - An interceptor chain for correlation ids, redaction and logging
 * - Optional token bucket rate limiting and response caching
 *
 * The resilience primitives live in `lifeline-core-resilience`.
 */

pub mod auth;
pub mod config;
pub mod connector;
pub mod error;
pub mod factory;
pub mod interceptor;
pub mod logging;
pub mod registries;
pub mod transport;

// Re-export commonly used types
pub use auth::{AuthAdapter, AuthType, DecryptedCredential};
pub use config::{ConnectorConfig, CredentialsFile, FrameworkConfig};
pub use connector::{
    BaseConnector, ConnectionStatus, Connector, ConnectorExt, ConnectorMetrics, ConnectorRequest,
    ConnectorResponse, HealthCheckResult, HealthStatus,
};
pub use error::{ConnectError, ConnectorError, Result};
pub use factory::ConnectorFactory;
pub use interceptor::{InterceptorChain, RequestContext};
pub use registries::Registries;
pub use transport::{HttpMethod, Transport};

pub use lifeline_core_resilience as resilience;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
