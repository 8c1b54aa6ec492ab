/*!
 * Process-wide registries of per-connector shared state
 *
 * Callers that use the same connector id share one circuit breaker, rate
 * limiter, response cache and interceptor chain. `Registries::global()` is
 * the default home for them; tests and embedders can build isolated sets
 * with `Registries::new()`.
 */

use crate::interceptor::InterceptorChain;
use lifeline_core_resilience::{CircuitBreaker, Registry, ResponseCache, TokenBucketRateLimiter};
use serde_json::Value;
use std::sync::{Arc, LazyLock};
use tracing::info;

static GLOBAL: LazyLock<Arc<Registries>> = LazyLock::new(|| Arc::new(Registries::new()));

#[derive(Debug)]
pub struct Registries {
    pub breakers: Registry<CircuitBreaker>,
    pub limiters: Registry<TokenBucketRateLimiter>,
    pub caches: Registry<ResponseCache<Value>>,
    pub interceptors: Registry<InterceptorChain>,
}

impl Registries {
    pub fn new() -> Self {
        Self {
            breakers: Registry::new("circuit-breakers"),
            limiters: Registry::new("rate-limiters"),
            caches: Registry::new("response-caches"),
            interceptors: Registry::new("interceptor-chains"),
        }
    }

    /// Shared process-wide instance
    pub fn global() -> Arc<Registries> {
        Arc::clone(&GLOBAL)
    }

    /// Drop every entry for one connector id
    pub fn remove(&self, connector_id: &str) {
        self.breakers.remove(connector_id);
        self.limiters.remove(connector_id);
        self.caches.remove(connector_id);
        self.interceptors.remove(connector_id);
    }

    /// Close all breakers, refill all buckets and empty all caches
    pub async fn reset_all(&self) {
        self.breakers.reset_all().await;
        self.limiters.reset_all();
        self.caches.clear_all();
        info!("All connector registries reset");
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}
