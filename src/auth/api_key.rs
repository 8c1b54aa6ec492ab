use super::{AuthAdapter, AuthType, DecryptedCredential};
use crate::config::ApiKeyLocation;
use crate::error::{ConnectError, Result};
use crate::transport::TransportRequest;
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;

/// Static API key in a header or query parameter
#[derive(Debug)]
pub struct ApiKeyAuth {
    location: ApiKeyLocation,
    name: String,
    prefix: Option<String>,
    key: Option<SecretString>,
}

impl ApiKeyAuth {
    pub fn new(location: ApiKeyLocation, name: impl Into<String>, prefix: Option<String>) -> Self {
        Self {
            location,
            name: name.into(),
            prefix,
            key: None,
        }
    }

    fn value(&self) -> Result<String> {
        let key = self
            .key
            .as_ref()
            .ok_or_else(|| ConnectError::Auth("API key not configured".to_string()))?;
        Ok(match &self.prefix {
            Some(prefix) => format!("{} {}", prefix, key.expose_secret()),
            None => key.expose_secret().to_string(),
        })
    }
}

#[async_trait]
impl AuthAdapter for ApiKeyAuth {
    fn auth_type(&self) -> AuthType {
        AuthType::ApiKey
    }

    fn configure(&mut self, credential: &DecryptedCredential) -> Result<()> {
        credential.expect_type(AuthType::ApiKey)?;
        let key = credential.require(&["api_key", "key"])?;
        self.key = Some(SecretString::from(key.to_string()));
        Ok(())
    }

    async fn auth_headers(&self) -> Result<BTreeMap<String, String>> {
        let mut headers = BTreeMap::new();
        if self.location == ApiKeyLocation::Header {
            headers.insert(self.name.clone(), self.value()?);
        }
        Ok(headers)
    }

    async fn apply_to_request(&self, mut request: TransportRequest) -> Result<TransportRequest> {
        match self.location {
            ApiKeyLocation::Header => {
                request.headers.insert(self.name.clone(), self.value()?);
            }
            ApiKeyLocation::Query => {
                let value = self.value()?;
                request.url.query_pairs_mut().append_pair(&self.name, &value);
            }
        }
        Ok(request)
    }

    fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    fn clear(&mut self) {
        self.key = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpMethod;
    use url::Url;

    fn request() -> TransportRequest {
        TransportRequest::new(
            HttpMethod::Get,
            Url::parse("https://registry.example/api/patients?ward=3").unwrap(),
        )
    }

    fn credential() -> DecryptedCredential {
        DecryptedCredential::new(AuthType::ApiKey).with("api_key", "abc123")
    }

    #[tokio::test]
    async fn test_header_with_prefix() {
        let mut auth = ApiKeyAuth::new(ApiKeyLocation::Header, "Authorization", Some("Bearer".into()));
        auth.configure(&credential()).unwrap();

        let request = auth.apply_to_request(request()).await.unwrap();
        assert_eq!(request.header_value("authorization"), Some("Bearer abc123"));
    }

    #[tokio::test]
    async fn test_query_placement() {
        let mut auth = ApiKeyAuth::new(ApiKeyLocation::Query, "api_key", None);
        auth.configure(&credential()).unwrap();

        assert!(auth.auth_headers().await.unwrap().is_empty());
        let request = auth.apply_to_request(request()).await.unwrap();
        assert_eq!(request.url.query(), Some("ward=3&api_key=abc123"));
    }

    #[tokio::test]
    async fn test_unconfigured_and_cleared() {
        let mut auth = ApiKeyAuth::new(ApiKeyLocation::Header, "X-API-Key", None);
        assert!(auth.apply_to_request(request()).await.is_err());

        auth.configure(&credential()).unwrap();
        assert!(auth.is_configured());
        auth.clear();
        assert!(!auth.is_configured());
    }

    #[test]
    fn test_rejects_wrong_credential_type() {
        let mut auth = ApiKeyAuth::new(ApiKeyLocation::Header, "X-API-Key", None);
        let basic = DecryptedCredential::new(AuthType::Basic).with("api_key", "x");
        assert!(auth.configure(&basic).is_err());
    }
}
