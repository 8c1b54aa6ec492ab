/*!
 * Configuration types for Lifeline connectors
 *
 * Files express durations as integer milliseconds; the `*_config()` helpers
 * turn them into the `Duration`-based configs of `lifeline-core-resilience`.
 */

use crate::auth::{AuthType, DecryptedCredential};
use crate::error::{ConnectError, Result};
use lifeline_core_resilience::{
    CacheConfig, CircuitBreakerConfig, RateLimitConfig, RetryPolicy, DEFAULT_RETRYABLE_ERRORS,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrameworkConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub connectors: Vec<ConnectorConfig>,
}

impl FrameworkConfig {
    /// Load and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConnectError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: FrameworkConfig = toml::from_str(content)
            .map_err(|e| ConnectError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for connector in &self.connectors {
            connector.validate()?;
            if !seen.insert(connector.id.as_str()) {
                return Err(ConnectError::Config(format!(
                    "duplicate connector id '{}'",
                    connector.id
                )));
            }
        }
        Ok(())
    }

    pub fn connector(&self, id: &str) -> Option<&ConnectorConfig> {
        self.connectors.iter().find(|c| c.id == id)
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Write JSON logs to this file instead of compact stdout output
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Shorthand for level = debug
    #[serde(default)]
    pub verbose: bool,
}

/// Where an API key is placed on the outgoing request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyLocation {
    #[default]
    Header,
    Query,
}

/// Authentication scheme and its non-secret settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthSettings {
    #[default]
    None,
    ApiKey {
        #[serde(default)]
        location: ApiKeyLocation,
        /// Header or query parameter name
        #[serde(default = "default_api_key_name")]
        name: String,
        /// Optional value prefix, e.g. "Bearer"
        #[serde(default)]
        prefix: Option<String>,
    },
    Basic,
    #[serde(rename = "oauth2")]
    OAuth2 {
        token_url: String,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default = "default_token_refresh_buffer_ms")]
        token_refresh_buffer_ms: u64,
    },
}

impl AuthSettings {
    pub fn auth_type(&self) -> AuthType {
        match self {
            AuthSettings::None => AuthType::None,
            AuthSettings::ApiKey { .. } => AuthType::ApiKey,
            AuthSettings::Basic => AuthType::Basic,
            AuthSettings::OAuth2 { .. } => AuthType::OAuth2,
        }
    }
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Time the circuit stays open before admitting trial requests
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_monitoring_period_ms")]
    pub monitoring_period_ms: u64,
    #[serde(default = "default_half_open_max_attempts")]
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_breaker_timeout_ms(),
            monitoring_period_ms: default_monitoring_period_ms(),
            half_open_max_attempts: default_half_open_max_attempts(),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(s: &CircuitBreakerSettings) -> Self {
        CircuitBreakerConfig {
            failure_threshold: s.failure_threshold,
            success_threshold: s.success_threshold,
            cooldown: Duration::from_millis(s.timeout_ms),
            monitoring_period: Duration::from_millis(s.monitoring_period_ms),
            half_open_max_attempts: s.half_open_max_attempts,
        }
    }
}

/// Retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_true")]
    pub jitter_enabled: bool,
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<String>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_enabled: true,
            retryable_errors: default_retryable_errors(),
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(s: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: s.max_attempts,
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            backoff_multiplier: s.backoff_multiplier,
            jitter: s.jitter_enabled,
            retryable_errors: s.retryable_errors.clone(),
        }
    }
}

/// Optional token bucket policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    pub max_requests_per_second: f64,
    #[serde(default)]
    pub max_concurrent_requests: Option<usize>,
    #[serde(default)]
    pub bucket_size: Option<f64>,
    #[serde(default = "default_true")]
    pub enable_queueing: bool,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,
}

impl From<&RateLimitSettings> for RateLimitConfig {
    fn from(s: &RateLimitSettings) -> Self {
        RateLimitConfig {
            max_requests_per_second: s.max_requests_per_second,
            max_concurrent_requests: s.max_concurrent_requests,
            bucket_size: s.bucket_size,
            enable_queueing: s.enable_queueing,
            max_queue_size: s.max_queue_size,
            queue_timeout: Duration::from_millis(s.queue_timeout_ms),
        }
    }
}

/// Optional response cache policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_cache_ttl_ms")]
    pub default_ttl_ms: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default)]
    pub stale_while_revalidate: bool,
    #[serde(default = "default_stale_ttl_ms")]
    pub stale_ttl_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_cache_ttl_ms(),
            max_entries: default_max_entries(),
            stale_while_revalidate: false,
            stale_ttl_ms: default_stale_ttl_ms(),
        }
    }
}

impl From<&CacheSettings> for CacheConfig {
    fn from(s: &CacheSettings) -> Self {
        CacheConfig {
            default_ttl: Duration::from_millis(s.default_ttl_ms),
            max_entries: s.max_entries,
            stale_while_revalidate: s.stale_while_revalidate,
            stale_ttl: Duration::from_millis(s.stale_ttl_ms),
        }
    }
}

/// Configuration of one external-service connector
///
/// Immutable once a connector is built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Unique id; also keys the shared breaker, limiter and cache
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Registered connector type; `None` uses the generic connector
    #[serde(default)]
    pub connector_type: Option<String>,

    pub base_url: String,

    /// Per-attempt timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub auth: AuthSettings,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub retry_policy: RetrySettings,

    #[serde(default)]
    pub rate_limit: Option<RateLimitSettings>,

    #[serde(default)]
    pub cache: Option<CacheSettings>,

    /// Headers sent with every request
    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,

    /// Path probed by `connect()` and `health_check()`
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,
}

impl ConnectorConfig {
    /// Minimal config with defaults for everything but identity and URL
    pub fn new(id: impl Into<String>, name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            connector_type: None,
            base_url: base_url.into(),
            timeout_ms: default_timeout_ms(),
            auth: AuthSettings::None,
            circuit_breaker: CircuitBreakerSettings::default(),
            retry_policy: RetrySettings::default(),
            rate_limit: None,
            cache: None,
            default_headers: BTreeMap::new(),
            health_check_path: default_health_check_path(),
        }
    }

    pub fn auth_type(&self) -> AuthType {
        self.auth.auth_type()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        (&self.circuit_breaker).into()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        (&self.retry_policy).into()
    }

    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.rate_limit.as_ref().map(Into::into)
    }

    pub fn cache_config(&self) -> Option<CacheConfig> {
        self.cache.as_ref().map(Into::into)
    }

    /// Parsed base URL
    pub fn base(&self) -> Result<Url> {
        Url::parse(&self.base_url).map_err(|e| {
            ConnectError::Config(format!(
                "connector '{}': invalid base_url '{}': {}",
                self.id, self.base_url, e
            ))
        })
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(ConnectError::Config(format!("connector '{}': {}", self.id, msg)));

        if self.id.trim().is_empty() {
            return Err(ConnectError::Config("connector id must not be empty".to_string()));
        }
        self.base()?;
        if self.timeout_ms == 0 {
            return fail("timeout_ms must be greater than 0");
        }
        if self.retry_policy.max_attempts == 0 {
            return fail("retry_policy.max_attempts must be at least 1");
        }
        if !(self.retry_policy.backoff_multiplier >= 1.0) {
            return fail("retry_policy.backoff_multiplier must be >= 1.0");
        }
        self.circuit_breaker_config()
            .validate()
            .map_err(|e| ConnectError::Config(format!("connector '{}': {}", self.id, e)))?;
        if let Some(rate) = self.rate_limit_config() {
            rate.validate()
                .map_err(|e| ConnectError::Config(format!("connector '{}': {}", self.id, e)))?;
        }
        if let Some(cache) = &self.cache {
            if cache.max_entries == 0 {
                return fail("cache.max_entries must be at least 1");
            }
        }
        if let AuthSettings::OAuth2 { token_url, .. } = &self.auth {
            Url::parse(token_url).map_err(|e| {
                ConnectError::Config(format!("connector '{}': invalid token_url: {}", self.id, e))
            })?;
        }
        Ok(())
    }
}

/// One `[[credentials]]` entry of a credentials file
#[derive(Deserialize)]
pub struct CredentialEntry {
    pub connector_id: String,
    #[serde(rename = "type")]
    pub credential_type: AuthType,
    #[serde(default)]
    data: HashMap<String, String>,
}

impl fmt::Debug for CredentialEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.data.keys().collect();
        keys.sort();
        f.debug_struct("CredentialEntry")
            .field("connector_id", &self.connector_id)
            .field("credential_type", &self.credential_type)
            .field("keys", &keys)
            .finish()
    }
}

/// Local stand-in for the credentials vault, used by the CLI
#[derive(Debug, Default, Deserialize)]
pub struct CredentialsFile {
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
}

impl CredentialsFile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConnectError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ConnectError::Config(format!("invalid credentials file: {}", e)))
    }

    /// Credentials keyed by connector id; later entries win
    pub fn into_credentials(self) -> HashMap<String, DecryptedCredential> {
        self.credentials
            .into_iter()
            .map(|entry| {
                (
                    entry.connector_id,
                    DecryptedCredential::from_map(entry.credential_type, entry.data),
                )
            })
            .collect()
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_breaker_timeout_ms() -> u64 {
    60_000
}

fn default_monitoring_period_ms() -> u64 {
    120_000
}

fn default_half_open_max_attempts() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_retryable_errors() -> Vec<String> {
    DEFAULT_RETRYABLE_ERRORS.iter().map(|s| s.to_string()).collect()
}

fn default_max_queue_size() -> usize {
    100
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

fn default_cache_ttl_ms() -> u64 {
    300_000
}

fn default_max_entries() -> usize {
    1_000
}

fn default_stale_ttl_ms() -> u64 {
    60_000
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_api_key_name() -> String {
    "X-API-Key".to_string()
}

fn default_token_refresh_buffer_ms() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
        [logging]
        level = "debug"

        [[connectors]]
        id = "hospital-registry"
        name = "Regional Hospital Registry"
        base_url = "https://registry.example.org/api"
        timeout_ms = 5000

        [connectors.auth]
        type = "api_key"
        location = "header"
        name = "Authorization"
        prefix = "Bearer"

        [connectors.circuit_breaker]
        failure_threshold = 3
        timeout_ms = 1000

        [connectors.rate_limit]
        max_requests_per_second = 10.0
        bucket_size = 20.0

        [connectors.cache]
        default_ttl_ms = 60000
        stale_while_revalidate = true

        [[connectors]]
        id = "border-services"
        name = "Border Services Agency"
        base_url = "https://cbsa.example.org"

        [connectors.auth]
        type = "oauth2"
        token_url = "https://cbsa.example.org/oauth/token"
        scope = "travel.read"
    "#;

    #[test]
    fn test_parse_sample() {
        let config = FrameworkConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.connectors.len(), 2);

        let hospital = config.connector("hospital-registry").unwrap();
        assert_eq!(hospital.auth_type(), AuthType::ApiKey);
        assert_eq!(hospital.circuit_breaker.failure_threshold, 3);
        // Unspecified fields fall back to defaults
        assert_eq!(hospital.circuit_breaker.success_threshold, 2);
        assert_eq!(hospital.retry_policy.max_attempts, 3);
        assert_eq!(hospital.timeout(), Duration::from_millis(5000));
        assert_eq!(hospital.rate_limit_config().unwrap().capacity(), 20.0);
        assert!(hospital.cache_config().unwrap().stale_while_revalidate);

        let border = config.connector("border-services").unwrap();
        assert_eq!(border.auth_type(), AuthType::OAuth2);
        assert!(border.rate_limit.is_none());
        assert_eq!(border.health_check_path, "/health");
    }

    #[test]
    fn test_breaker_settings_conversion() {
        let settings = CircuitBreakerSettings {
            timeout_ms: 1500,
            ..Default::default()
        };
        let config: CircuitBreakerConfig = (&settings).into();
        assert_eq!(config.cooldown, Duration::from_millis(1500));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ConnectorConfig::new("x", "X", "not a url");
        assert!(config.validate().is_err());

        config.base_url = "https://ok.example".to_string();
        assert!(config.validate().is_ok());

        config.retry_policy.max_attempts = 0;
        assert!(config.validate().is_err());
        config.retry_policy.max_attempts = 1;

        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let config = FrameworkConfig {
            logging: LoggingConfig::default(),
            connectors: vec![
                ConnectorConfig::new("dup", "A", "https://a.example"),
                ConnectorConfig::new("dup", "B", "https://b.example"),
            ],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = FrameworkConfig::from_file(file.path()).unwrap();
        assert_eq!(config.connectors[0].id, "hospital-registry");

        assert!(FrameworkConfig::from_file("/nonexistent/lifeline.toml").is_err());
    }

    #[test]
    fn test_credentials_file() {
        let file = CredentialsFile::from_toml_str(
            r#"
            [[credentials]]
            connector_id = "hospital-registry"
            type = "api_key"
            data = { api_key = "k-123" }

            [[credentials]]
            connector_id = "border-services"
            type = "oauth2"
            data = { client_id = "lifeline", client_secret = "s3cret" }
            "#,
        )
        .unwrap();
        assert!(!format!("{:?}", file).contains("s3cret"));

        let credentials = file.into_credentials();
        let hospital = &credentials["hospital-registry"];
        assert_eq!(hospital.credential_type, AuthType::ApiKey);
        assert_eq!(hospital.get("api_key"), Some("k-123"));
        assert_eq!(
            credentials["border-services"].get("client_id"),
            Some("lifeline")
        );

        assert!(CredentialsFile::from_toml_str("[[credentials]]\ntype = \"basic\"").is_err());
    }
}
