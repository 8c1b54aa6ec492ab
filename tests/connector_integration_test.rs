//! End-to-end connector behaviour over the in-memory transport
//!
//! Every test builds its own `Registries` so shared breaker/limiter/cache
//! state never leaks between tests.

use lifeline::auth::{AuthType, DecryptedCredential, OAuthTokens, TokenRefreshListener};
use lifeline::config::{AuthSettings, CacheSettings, ConnectorConfig, FrameworkConfig, RateLimitSettings};
use lifeline::connector::{BaseConnector, ConnectionStatus, Connector, ConnectorRequest, HealthStatus};
use lifeline::factory::ConnectorFactory;
use lifeline::registries::Registries;
use lifeline::resilience::CircuitState;
use lifeline::transport::{MockRoute, MockTransport};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn config(id: &str, base_url: &str) -> ConnectorConfig {
    let mut config = ConnectorConfig::new(id, id, base_url);
    config.retry_policy.base_delay_ms = 100;
    config.retry_policy.max_delay_ms = 1_000;
    config.retry_policy.jitter_enabled = false;
    config
}

fn build(config: ConnectorConfig, mock: &MockTransport, registries: &Arc<Registries>) -> BaseConnector {
    BaseConnector::builder(config)
        .transport(Arc::new(mock.clone()))
        .registries(Arc::clone(registries))
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_are_reported() {
    let mock = MockTransport::new();
    mock.route(MockRoute::get("/records").status(503));
    let connector = build(config("records", "https://records.example"), &mock, &Arc::new(Registries::new()));

    let started = tokio::time::Instant::now();
    let response = connector.execute(ConnectorRequest::get("/records")).await;
    let error = response.error.unwrap();

    assert_eq!(error.code, "RETRY_EXHAUSTED");
    assert_eq!(error.details["delaysMs"], json!([100, 200]));
    assert_eq!(response.metadata.retry_count, 2);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(mock.request_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_every_attempt_times_out() {
    let mock = MockTransport::new();
    mock.route(MockRoute::get("/slow").delay(Duration::from_secs(10)));
    let mut config = config("slow", "https://slow.example");
    config.timeout_ms = 500;
    let connector = build(config, &mock, &Arc::new(Registries::new()));

    let response = connector.execute(ConnectorRequest::get("/slow")).await;
    let error = response.error.unwrap();
    assert_eq!(error.code, "RETRY_EXHAUSTED");
    assert_eq!(error.details["lastErrorCode"], "ETIMEDOUT");
    assert!(error.retryable);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_is_shared_by_connector_id_and_recovers() {
    let mock = MockTransport::new();
    mock.route(MockRoute::get("/status").status(500).times(2));
    mock.route(MockRoute::get("/status").json(json!({"ok": true})));

    let mut config = config("transit", "https://transit.example");
    config.retry_policy.max_attempts = 1;
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.success_threshold = 2;
    config.circuit_breaker.timeout_ms = 1_000;

    let registries = Arc::new(Registries::new());
    let a = build(config.clone(), &mock, &registries);
    let b = build(config, &mock, &registries);
    assert!(Arc::ptr_eq(a.circuit_breaker(), b.circuit_breaker()));

    let mut transitions = a.circuit_breaker().subscribe();
    a.execute(ConnectorRequest::get("/status")).await;
    a.execute(ConnectorRequest::get("/status")).await;
    assert!(transitions.try_recv().unwrap().is_trip());

    let rejected = b.execute(ConnectorRequest::get("/status")).await;
    assert_eq!(rejected.error_code(), Some("CIRCUIT_BREAKER_OPEN"));
    assert_eq!(rejected.metadata.circuit_breaker_state, CircuitState::Open);
    assert_eq!(mock.request_count(), 2);

    tokio::time::advance(Duration::from_millis(1_001)).await;
    assert!(b.execute(ConnectorRequest::get("/status")).await.success);
    assert_eq!(b.circuit_breaker().state().await, CircuitState::HalfOpen);
    assert!(a.execute(ConnectorRequest::get("/status")).await.success);
    assert_eq!(a.circuit_breaker().state().await, CircuitState::Closed);

    let stats = a.circuit_breaker().stats().await;
    assert_eq!(stats.total_trips, 1);
}

#[derive(Default)]
struct TokenStore {
    refreshes: AtomicUsize,
}

impl TokenRefreshListener for TokenStore {
    fn on_tokens_refreshed(&self, tokens: &OAuthTokens) {
        assert!(tokens.refresh_token.is_some());
        self.refreshes.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_oauth2_connector_end_to_end() {
    let mock = MockTransport::new();
    mock.route(MockRoute::post("/oauth/token").json(json!({
        "access_token": "tok-1",
        "refresh_token": "r-1",
        "expires_in": 3600
    })));
    mock.route(MockRoute::get("/api/health"));
    mock.route(MockRoute::get("/api/travellers/42").json(json!({"id": 42, "lastSeen": "YVR"})));

    let mut config = config("border", "https://border.example/api");
    config.auth = AuthSettings::OAuth2 {
        token_url: "https://border.example/oauth/token".into(),
        scope: Some("travel.read".into()),
        token_refresh_buffer_ms: 60_000,
    };
    let store = Arc::new(TokenStore::default());
    let connector = BaseConnector::builder(config)
        .transport(Arc::new(mock.clone()))
        .registries(Arc::new(Registries::new()))
        .token_listener(store.clone())
        .build()
        .unwrap();

    connector
        .set_credentials(
            DecryptedCredential::new(AuthType::OAuth2)
                .with("client_id", "lifeline")
                .with("client_secret", "s3cret"),
        )
        .await
        .unwrap();
    connector.connect().await.unwrap();
    assert_eq!(connector.status(), ConnectionStatus::Connected);

    let response = connector
        .execute(ConnectorRequest::get("/travellers/42"))
        .await;
    assert_eq!(response.data, Some(json!({"id": 42, "lastSeen": "YVR"})));

    let call = mock.requests_to("/api/travellers/42").pop().unwrap();
    assert_eq!(call.header("authorization"), Some("Bearer tok-1"));
    assert_eq!(mock.requests_to("/oauth/token").len(), 1);
    assert_eq!(store.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_while_revalidate() {
    let mock = MockTransport::new();
    mock.route(MockRoute::get("/cases").json(json!(["v1"])).times(1));
    mock.route(MockRoute::get("/cases").json(json!(["v2"])));

    let mut config = config("cases", "https://cases.example");
    config.cache = Some(CacheSettings {
        default_ttl_ms: 100,
        max_entries: 10,
        stale_while_revalidate: true,
        stale_ttl_ms: 1_000,
    });
    let connector = build(config, &mock, &Arc::new(Registries::new()));

    let fresh = connector.execute_managed(ConnectorRequest::get("/cases")).await;
    assert_eq!(fresh.data, Some(json!(["v1"])));

    tokio::time::advance(Duration::from_millis(150)).await;
    let stale = connector.execute_managed(ConnectorRequest::get("/cases")).await;
    assert!(stale.metadata.cached);
    assert!(stale.metadata.stale);
    assert_eq!(stale.data, Some(json!(["v1"])));

    // Let the background refresh land
    tokio::time::sleep(Duration::from_millis(10)).await;
    let refreshed = connector.execute_managed(ConnectorRequest::get("/cases")).await;
    assert!(refreshed.metadata.cached);
    assert!(!refreshed.metadata.stale);
    assert_eq!(refreshed.data, Some(json!(["v2"])));
    assert_eq!(mock.request_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_queue_spaces_requests() {
    let mock = MockTransport::new();
    mock.route(MockRoute::get("/sightings").json(json!([])));

    let mut config = config("sightings", "https://sightings.example");
    config.rate_limit = Some(RateLimitSettings {
        max_requests_per_second: 10.0,
        max_concurrent_requests: None,
        bucket_size: Some(1.0),
        enable_queueing: true,
        max_queue_size: 10,
        queue_timeout_ms: 5_000,
    });
    let connector = build(config, &mock, &Arc::new(Registries::new()));

    let started = tokio::time::Instant::now();
    let (a, b, c) = tokio::join!(
        connector.execute_managed(ConnectorRequest::get("/sightings")),
        connector.execute_managed(ConnectorRequest::get("/sightings")),
        connector.execute_managed(ConnectorRequest::get("/sightings")),
    );
    assert!(a.success && b.success && c.success);
    assert!(started.elapsed() >= Duration::from_millis(200));

    let limiter = connector.rate_limiter().unwrap().metrics();
    assert_eq!(limiter.allowed_requests, 3);
    assert_eq!(limiter.queued_requests, 2);
}

#[tokio::test]
async fn test_factory_from_config_file() {
    let config = FrameworkConfig::from_toml_str(
        r#"
        [[connectors]]
        id = "hospital"
        name = "Hospital Registry"
        base_url = "https://hospital.example"

        [[connectors]]
        id = "transit"
        name = "Transit Authority"
        base_url = "https://transit.example"
        health_check_path = "/ping"

        [connectors.retry_policy]
        max_attempts = 1
        "#,
    )
    .unwrap();

    let mock = MockTransport::new();
    mock.route(MockRoute::get("/health"));
    mock.route(MockRoute::get("/ping").status(503));

    let factory = ConnectorFactory::new()
        .with_transport(Arc::new(mock.clone()))
        .with_registries(Arc::new(Registries::new()));
    for connector in &config.connectors {
        factory.create(connector.clone()).await.unwrap();
    }

    let health = factory.check_all_health().await;
    assert_eq!(health[0].connector_id, "hospital");
    assert_eq!(health[0].status, HealthStatus::Healthy);
    assert_eq!(health[1].status, HealthStatus::Unhealthy);
    assert!(health[1].message.as_deref().unwrap().contains("503"));

    assert!(factory
        .initialize("transit", DecryptedCredential::new(AuthType::None))
        .await
        .is_err());
    let transit = factory.get("transit").await.unwrap();
    assert_eq!(transit.status().await, ConnectionStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_calls_give_back_limiter_slots() {
    let mock = MockTransport::new();
    mock.route(MockRoute::get("/reports").delay(Duration::from_secs(60)).times(2));
    mock.route(MockRoute::get("/reports").json(json!([])));

    let mut config = config("reports", "https://reports.example");
    config.timeout_ms = 120_000;
    config.rate_limit = Some(RateLimitSettings {
        max_requests_per_second: 100.0,
        max_concurrent_requests: Some(2),
        bucket_size: None,
        enable_queueing: false,
        max_queue_size: 0,
        queue_timeout_ms: 0,
    });
    let connector = build(config, &mock, &Arc::new(Registries::new()));

    let in_flight: Vec<_> = (0..2)
        .map(|_| {
            let connector = connector.clone();
            tokio::spawn(async move { connector.execute_managed(ConnectorRequest::get("/reports")).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let throttled = connector.execute_managed(ConnectorRequest::get("/reports")).await;
    assert_eq!(throttled.error_code(), Some("RATE_LIMIT_EXCEEDED"));

    for task in &in_flight {
        task.abort();
    }
    for task in in_flight {
        assert!(task.await.unwrap_err().is_cancelled());
    }
    assert_eq!(connector.rate_limiter().unwrap().metrics().current_concurrency, 0);

    let response = connector.execute_managed(ConnectorRequest::get("/reports")).await;
    assert!(response.success);
    assert_eq!(mock.request_count(), 3);
}
