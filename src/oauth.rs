use async_trait::async_trait;

use crate::error::{RelayError, Result};
use crate::token::TokenGrant;

/// HubSpot's OAuth token endpoint.
pub const HUBSPOT_TOKEN_URL: &str = "https://api.hubapi.com/oauth/v1/token";

/// Broker interface for obtaining a usable bearer token for a tenant.
#[async_trait]
pub trait TokenBroker: Send + Sync {
    /// Fetch a currently valid access token, refreshing if needed.
    async fn access_token(&self, tenant_id: &str) -> Result<String>;

    /// Check whether the tenant has completed authorization.
    async fn is_connected(&self, tenant_id: &str) -> bool;
}

/// The external authorization server's token endpoint.
#[async_trait]
pub trait AuthorizationServer: Send + Sync {
    /// `grant_type=refresh_token` exchange.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;

    /// `grant_type=authorization_code` exchange.
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant>;
}

/// Client credentials for the token endpoint.
#[derive(Clone)]
pub struct OAuthClientConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: Option<String>,
}

impl std::fmt::Debug for OAuthClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthClientConfig")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

/// Form-encoded token endpoint client.
pub struct HttpAuthorizationServer {
    http: reqwest::Client,
    config: OAuthClientConfig,
}

impl HttpAuthorizationServer {
    pub fn new(config: OAuthClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Use a preconfigured HTTP client (timeouts, proxies).
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn config(&self) -> &OAuthClientConfig {
        &self.config
    }

    async fn post_form(&self, params: &[(&str, &str)]) -> Result<TokenGrant> {
        let resp = self
            .http
            .post(&self.config.token_url)
            .form(params)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::RefreshFailed { status, body });
        }

        Ok(resp.json::<TokenGrant>().await?)
    }
}

#[async_trait]
impl AuthorizationServer for HttpAuthorizationServer {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
        self.post_form(&[
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ])
        .await
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenGrant> {
        let redirect_uri = self.config.redirect_uri.as_deref().ok_or_else(|| {
            RelayError::Config("redirect_uri is required for code exchange".to_string())
        })?;

        self.post_form(&[
            ("grant_type", "authorization_code"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", redirect_uri),
            ("code", code),
        ])
        .await
    }
}
