//! Authentication adapters
//!
//! Every connector owns one [`AuthAdapter`]. The adapter is configured from a
//! [`DecryptedCredential`] handed over by the credentials vault and then
//! stamps each outgoing request. Secrets stay in [`SecretString`] and are never
//! logged or serialized.

mod api_key;
mod basic;
mod oauth2;

pub use api_key::ApiKeyAuth;
pub use basic::BasicAuth;
pub use oauth2::{OAuth2Auth, OAuthTokens, TokenRefreshListener};

use crate::config::AuthSettings;
use crate::error::{ConnectError, Result};
use crate::transport::{Transport, TransportRequest};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Authentication scheme of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    #[default]
    None,
    ApiKey,
    Basic,
    #[serde(rename = "oauth2")]
    OAuth2,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::None => "none",
            AuthType::ApiKey => "api_key",
            AuthType::Basic => "basic",
            AuthType::OAuth2 => "oauth2",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential material as released by the vault
#[derive(Debug)]
pub struct DecryptedCredential {
    pub credential_type: AuthType,
    pub data: HashMap<String, SecretString>,
}

impl DecryptedCredential {
    pub fn new(credential_type: AuthType) -> Self {
        Self {
            credential_type,
            data: HashMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data
            .insert(key.into(), SecretString::from(value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(|v| v.expose_secret())
    }

    /// First present key among `keys`, or an auth error naming the first
    pub fn require(&self, keys: &[&str]) -> Result<&str> {
        keys.iter()
            .find_map(|k| self.get(k))
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ConnectError::Auth(format!(
                    "{} credential is missing '{}'",
                    self.credential_type,
                    keys.first().copied().unwrap_or_default()
                ))
            })
    }

    /// Build from plain strings, e.g. a credentials file
    pub fn from_map(credential_type: AuthType, data: HashMap<String, String>) -> Self {
        Self {
            credential_type,
            data: data
                .into_iter()
                .map(|(k, v)| (k, SecretString::from(v)))
                .collect(),
        }
    }

    fn expect_type(&self, expected: AuthType) -> Result<()> {
        if self.credential_type != expected {
            return Err(ConnectError::Auth(format!(
                "expected {} credential, got {}",
                expected, self.credential_type
            )));
        }
        Ok(())
    }
}

/// Attaches credentials to outgoing requests
#[async_trait]
pub trait AuthAdapter: Send + Sync + fmt::Debug {
    fn auth_type(&self) -> AuthType;

    /// Load credential material, replacing anything configured before
    fn configure(&mut self, credential: &DecryptedCredential) -> Result<()>;

    /// Headers to add to a request
    async fn auth_headers(&self) -> Result<BTreeMap<String, String>>;

    /// Return a copy of `request` carrying credentials
    async fn apply_to_request(&self, mut request: TransportRequest) -> Result<TransportRequest> {
        for (name, value) in self.auth_headers().await? {
            request.headers.insert(name, value);
        }
        Ok(request)
    }

    fn is_configured(&self) -> bool;

    /// Drop all credential material
    fn clear(&mut self);
}

/// Adapter for services that need no credentials
#[derive(Debug, Default)]
pub struct NoAuth;

#[async_trait]
impl AuthAdapter for NoAuth {
    fn auth_type(&self) -> AuthType {
        AuthType::None
    }

    fn configure(&mut self, _credential: &DecryptedCredential) -> Result<()> {
        Ok(())
    }

    async fn auth_headers(&self) -> Result<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    async fn apply_to_request(&self, request: TransportRequest) -> Result<TransportRequest> {
        Ok(request)
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn clear(&mut self) {}
}

/// Build the adapter matching a connector's auth settings
///
/// OAuth2 token requests go through `transport`, so they share the
/// connector's TLS setup and can be mocked in tests.
pub fn create_auth_adapter(
    settings: &AuthSettings,
    transport: Arc<dyn Transport>,
) -> Result<Box<dyn AuthAdapter>> {
    Ok(match settings {
        AuthSettings::None => Box::new(NoAuth),
        AuthSettings::ApiKey {
            location,
            name,
            prefix,
        } => Box::new(ApiKeyAuth::new(*location, name.clone(), prefix.clone())),
        AuthSettings::Basic => Box::new(BasicAuth::new()),
        AuthSettings::OAuth2 {
            token_url,
            scope,
            token_refresh_buffer_ms,
        } => Box::new(OAuth2Auth::from_settings(
            token_url,
            scope.clone(),
            *token_refresh_buffer_ms,
            transport,
        )?),
    })
}
