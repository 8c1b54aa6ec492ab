/*!
 * Connector factory
 *
 * Owns every live connector keyed by id. Connectors are built once, from a
 * registered constructor matching `connector_type` or as a plain
 * `BaseConnector`, and stay until removed or reaped by idle cleanup.
 */

use crate::auth::DecryptedCredential;
use crate::config::ConnectorConfig;
use crate::connector::{BaseConnector, Connector, ConnectorMetrics, HealthCheckResult};
use crate::error::{ConnectError, Result};
use crate::registries::Registries;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Wraps a built `BaseConnector` into a domain connector
pub type ConnectorConstructor =
    Arc<dyn Fn(BaseConnector) -> Result<Arc<dyn Connector>> + Send + Sync>;

struct Entry {
    connector: Arc<dyn Connector>,
    created_at: DateTime<Utc>,
    last_used: Instant,
}

/// Summary of a managed connector
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub id: String,
    pub name: String,
    pub connector_type: Option<String>,
    pub created_at: DateTime<Utc>,
    pub idle: Duration,
}

pub struct ConnectorFactory {
    connectors: RwLock<HashMap<String, Entry>>,
    constructors: std::sync::RwLock<HashMap<String, ConnectorConstructor>>,
    transport: Option<Arc<dyn Transport>>,
    registries: Arc<Registries>,
}

impl fmt::Debug for ConnectorFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<String> = self
            .constructors
            .read()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ConnectorFactory")
            .field("types", &types)
            .finish_non_exhaustive()
    }
}

impl ConnectorFactory {
    /// Factory over HTTP and the global registries
    pub fn new() -> Self {
        Self {
            connectors: RwLock::new(HashMap::new()),
            constructors: std::sync::RwLock::new(HashMap::new()),
            transport: None,
            registries: Registries::global(),
        }
    }

    /// Use `transport` for every connector this factory builds
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_registries(mut self, registries: Arc<Registries>) -> Self {
        self.registries = registries;
        self
    }

    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }

    /// Register a constructor for configs whose `connector_type` is `name`
    pub fn register_type<F>(&self, name: impl Into<String>, constructor: F)
    where
        F: Fn(BaseConnector) -> Result<Arc<dyn Connector>> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!(connector_type = %name, "Registering connector type");
        self.constructors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name, Arc::new(constructor));
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.constructors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(name)
    }

    fn build(&self, config: ConnectorConfig) -> Result<Arc<dyn Connector>> {
        let constructor = config.connector_type.as_deref().and_then(|t| {
            self.constructors
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(t)
                .cloned()
        });
        if constructor.is_none() {
            if let Some(t) = &config.connector_type {
                warn!(connector_id = %config.id, connector_type = %t, "Unknown connector type, using generic connector");
            }
        }

        let mut builder = BaseConnector::builder(config).registries(Arc::clone(&self.registries));
        if let Some(transport) = &self.transport {
            builder = builder.transport(Arc::clone(transport));
        }
        let base = builder.build()?;

        match constructor {
            Some(constructor) => constructor(base),
            None => Ok(Arc::new(base)),
        }
    }

    fn insert(
        &self,
        connectors: &mut HashMap<String, Entry>,
        config: ConnectorConfig,
    ) -> Result<Arc<dyn Connector>> {
        let id = config.id.clone();
        let connector = self.build(config)?;
        connectors.insert(
            id.clone(),
            Entry {
                connector: Arc::clone(&connector),
                created_at: Utc::now(),
                last_used: Instant::now(),
            },
        );
        info!(connector_id = %id, "Connector created");
        Ok(connector)
    }

    /// Build and register a connector; fails if the id is already taken
    pub async fn create(&self, config: ConnectorConfig) -> Result<Arc<dyn Connector>> {
        let mut connectors = self.connectors.write().await;
        if connectors.contains_key(&config.id) {
            return Err(ConnectError::Config(format!(
                "connector '{}' already exists",
                config.id
            )));
        }
        self.insert(&mut connectors, config)
    }

    /// Look up a connector, marking it as used
    pub async fn get(&self, id: &str) -> Option<Arc<dyn Connector>> {
        let mut connectors = self.connectors.write().await;
        connectors.get_mut(id).map(|entry| {
            entry.last_used = Instant::now();
            Arc::clone(&entry.connector)
        })
    }

    /// Existing connector for `config.id`, or a newly built one
    pub async fn get_or_create(&self, config: ConnectorConfig) -> Result<Arc<dyn Connector>> {
        let mut connectors = self.connectors.write().await;
        if let Some(entry) = connectors.get_mut(&config.id) {
            entry.last_used = Instant::now();
            return Ok(Arc::clone(&entry.connector));
        }
        self.insert(&mut connectors, config)
    }

    /// Hand `credential` to the connector and connect it
    pub async fn initialize(&self, id: &str, credential: DecryptedCredential) -> Result<()> {
        let connector = self
            .get(id)
            .await
            .ok_or_else(|| ConnectError::Config(format!("connector '{}' not found", id)))?;
        connector.set_credentials(credential).await?;
        connector.connect().await
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.connectors.read().await.contains_key(id)
    }

    /// Disconnect and drop a connector along with its shared breaker,
    /// limiter, cache and interceptors; returns whether it existed
    pub async fn remove(&self, id: &str) -> bool {
        let removed = self.connectors.write().await.remove(id);
        match removed {
            Some(entry) => {
                entry.connector.disconnect().await;
                self.registries.remove(id);
                info!(connector_id = %id, "Connector removed");
                true
            }
            None => false,
        }
    }

    /// Disconnect and evict connectors unused for longer than `threshold`
    pub async fn cleanup_idle(&self, threshold: Duration) -> Vec<String> {
        let evicted: Vec<(String, Arc<dyn Connector>)> = {
            let mut connectors = self.connectors.write().await;
            let idle: Vec<String> = connectors
                .iter()
                .filter(|(_, entry)| entry.last_used.elapsed() > threshold)
                .map(|(id, _)| id.clone())
                .collect();
            idle.into_iter()
                .filter_map(|id| connectors.remove(&id).map(|entry| (id, entry.connector)))
                .collect()
        };

        for (id, connector) in &evicted {
            connector.disconnect().await;
            self.registries.remove(id);
            info!(connector_id = %id, idle_threshold_ms = threshold.as_millis() as u64, "Idle connector evicted");
        }
        evicted.into_iter().map(|(id, _)| id).collect()
    }

    fn snapshot(connectors: &HashMap<String, Entry>) -> Vec<Arc<dyn Connector>> {
        let mut all: Vec<_> = connectors.values().map(|e| Arc::clone(&e.connector)).collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Probe every connector concurrently, ordered by id
    pub async fn check_all_health(&self) -> Vec<HealthCheckResult> {
        let connectors = Self::snapshot(&*self.connectors.read().await);
        join_all(connectors.iter().map(|c| c.health_check())).await
    }

    /// Metrics of every connector, ordered by id
    pub async fn get_all_metrics(&self) -> Vec<ConnectorMetrics> {
        let connectors = Self::snapshot(&*self.connectors.read().await);
        join_all(connectors.iter().map(|c| c.metrics())).await
    }

    pub async fn list(&self) -> Vec<ConnectorInfo> {
        let connectors = self.connectors.read().await;
        let mut infos: Vec<ConnectorInfo> = connectors
            .iter()
            .map(|(id, entry)| ConnectorInfo {
                id: id.clone(),
                name: entry.connector.name().to_string(),
                connector_type: entry.connector.config().connector_type.clone(),
                created_at: entry.created_at,
                idle: entry.last_used.elapsed(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connectors.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.connectors.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connectors.read().await.is_empty()
    }
}

impl Default for ConnectorFactory {
    fn default() -> Self {
        Self::new()
    }
}
