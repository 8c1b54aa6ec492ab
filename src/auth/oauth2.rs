//! OAuth2 client-credentials adapter with token refresh
//!
//! The access token is cached until it is within the refresh buffer of its
//! expiry. Renewal tries the refresh-token grant first and falls back to a
//! fresh client-credentials grant when that fails. The token state sits
//! behind its own mutex, held across the token request, so concurrent
//! callers trigger at most one renewal. Client credentials live outside
//! that mutex; they only change through `&mut self`.

use super::{AuthAdapter, AuthType, DecryptedCredential};
use crate::error::{ConnectError, Result};
use crate::transport::{HttpMethod, RequestBody, Transport, TransportRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Tokens issued by the authorization server
pub struct OAuthTokens {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for OAuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthTokens")
            .field("access_token", &"[REDACTED]")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Notified whenever new tokens are obtained, so they can be persisted
pub trait TokenRefreshListener: Send + Sync {
    fn on_tokens_refreshed(&self, tokens: &OAuthTokens);
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct ClientCredentials {
    id: String,
    secret: SecretString,
}

#[derive(Default)]
struct TokenState {
    access_token: Option<SecretString>,
    refresh_token: Option<SecretString>,
    /// Monotonic expiry; `None` means the token does not expire
    expires_at: Option<Instant>,
}

impl TokenState {
    fn needs_refresh(&self, buffer: Duration) -> bool {
        match (&self.access_token, self.expires_at) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(_), Some(expires_at)) => Instant::now() + buffer >= expires_at,
        }
    }
}

pub struct OAuth2Auth {
    token_url: Url,
    scope: Option<String>,
    refresh_buffer: Duration,
    transport: Arc<dyn Transport>,
    listener: Option<Arc<dyn TokenRefreshListener>>,
    client: Option<ClientCredentials>,
    state: Mutex<TokenState>,
}

impl fmt::Debug for OAuth2Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2Auth")
            .field("token_url", &self.token_url.as_str())
            .field("scope", &self.scope)
            .field("refresh_buffer", &self.refresh_buffer)
            .finish_non_exhaustive()
    }
}

impl OAuth2Auth {
    pub fn new(
        token_url: Url,
        scope: Option<String>,
        refresh_buffer: Duration,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            token_url,
            scope,
            refresh_buffer,
            transport,
            listener: None,
            client: None,
            state: Mutex::new(TokenState::default()),
        }
    }

    /// Build from config values, validating the token URL
    pub fn from_settings(
        token_url: &str,
        scope: Option<String>,
        token_refresh_buffer_ms: u64,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let token_url = Url::parse(token_url)
            .map_err(|e| ConnectError::Config(format!("invalid token_url: {}", e)))?;
        Ok(Self::new(
            token_url,
            scope,
            Duration::from_millis(token_refresh_buffer_ms),
            transport,
        ))
    }

    pub fn set_listener(&mut self, listener: Arc<dyn TokenRefreshListener>) {
        self.listener = Some(listener);
    }

    /// Cached access token, renewed when missing or about to expire
    pub async fn valid_access_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if !state.needs_refresh(self.refresh_buffer) {
            if let Some(token) = &state.access_token {
                return Ok(token.expose_secret().to_string());
            }
        }

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ConnectError::Auth("OAuth2 client not configured".to_string()))?;
        let client_id = client.id.clone();
        let client_secret = client.secret.expose_secret().to_string();

        let mut issued = None;
        if let Some(refresh_token) = state.refresh_token.as_ref().map(|t| t.expose_secret().to_string()) {
            let form = vec![
                ("grant_type".to_string(), "refresh_token".to_string()),
                ("refresh_token".to_string(), refresh_token),
                ("client_id".to_string(), client_id.clone()),
                ("client_secret".to_string(), client_secret.clone()),
            ];
            match self.request_token(form).await {
                Ok(tokens) => issued = Some(tokens),
                Err(e) => warn!(error = %e, "OAuth2 refresh grant failed, falling back to client credentials"),
            }
        }

        let tokens = match issued {
            Some(tokens) => tokens,
            None => {
                let mut form = vec![
                    ("grant_type".to_string(), "client_credentials".to_string()),
                    ("client_id".to_string(), client_id),
                    ("client_secret".to_string(), client_secret),
                ];
                if let Some(scope) = &self.scope {
                    form.push(("scope".to_string(), scope.clone()));
                }
                self.request_token(form).await?
            }
        };

        let access_token = tokens.access_token.clone();
        state.access_token = Some(SecretString::from(tokens.access_token));
        if let Some(refresh) = tokens.refresh_token {
            state.refresh_token = Some(SecretString::from(refresh));
        }
        let lifetime = tokens.expires_in.map(Duration::from_secs);
        state.expires_at = lifetime.map(|d| Instant::now() + d);
        info!(token_url = %self.token_url, expires_in_secs = ?tokens.expires_in, "OAuth2 access token renewed");

        if let Some(listener) = &self.listener {
            let snapshot = OAuthTokens {
                access_token: SecretString::from(access_token.clone()),
                refresh_token: state
                    .refresh_token
                    .as_ref()
                    .map(|t| SecretString::from(t.expose_secret().to_string())),
                expires_at: lifetime
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .map(|d| Utc::now() + d),
            };
            listener.on_tokens_refreshed(&snapshot);
        }

        Ok(access_token)
    }

    async fn request_token(&self, form: Vec<(String, String)>) -> Result<TokenResponse> {
        let grant = form
            .first()
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        debug!(token_url = %self.token_url, grant = %grant, "Requesting OAuth2 token");

        let request = TransportRequest::new(HttpMethod::Post, self.token_url.clone())
            .header("Accept", "application/json")
            .body(RequestBody::Form(form));
        let response = self
            .transport
            .send(request, &CancellationToken::new())
            .await?;

        if !response.is_success() {
            return Err(ConnectError::Auth(format!(
                "token endpoint returned {} for {} grant",
                response.status, grant
            )));
        }
        serde_json::from_slice(&response.body)
            .map_err(|e| ConnectError::Auth(format!("invalid token response: {}", e)))
    }
}

#[async_trait]
impl AuthAdapter for OAuth2Auth {
    fn auth_type(&self) -> AuthType {
        AuthType::OAuth2
    }

    /// Expects `client_id` and `client_secret`; `access_token`,
    /// `refresh_token` and `expires_in` (seconds) seed an existing session
    fn configure(&mut self, credential: &DecryptedCredential) -> Result<()> {
        credential.expect_type(AuthType::OAuth2)?;
        let client_id = credential.require(&["client_id"])?.to_string();
        let client_secret = credential.require(&["client_secret"])?.to_string();

        let expires_in = match credential.get("expires_in") {
            Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
                ConnectError::Auth(format!("invalid expires_in '{}'", raw))
            })?),
            None => None,
        };

        self.client = Some(ClientCredentials {
            id: client_id,
            secret: SecretString::from(client_secret),
        });
        *self.state.get_mut() = TokenState {
            access_token: credential
                .get("access_token")
                .map(|t| SecretString::from(t.to_string())),
            refresh_token: credential
                .get("refresh_token")
                .map(|t| SecretString::from(t.to_string())),
            expires_at: expires_in.map(|s| Instant::now() + Duration::from_secs(s)),
        };
        Ok(())
    }

    async fn auth_headers(&self) -> Result<BTreeMap<String, String>> {
        let token = self.valid_access_token().await?;
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        Ok(headers)
    }

    fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    fn clear(&mut self) {
        self.client = None;
        *self.state.get_mut() = TokenState::default();
    }
}
