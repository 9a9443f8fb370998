//! # Relay Configuration
//!
//! One file (`relay.toml` or `relay.yaml`) describes the OAuth client, the
//! workflow webhook, the CRM endpoint and the polling budget. Secrets are
//! usually injected from the environment with
//! [`RelayConfig::with_env_overrides`].
//!
//! ```toml
//! namespace = "hubspot"
//!
//! [oauth]
//! client_id = "..."
//! client_secret = "..."
//! redirect_uri = "https://relay.example.com/oauth-callback"
//!
//! [trigger]
//! webhook_url = "https://flows.example.com/hooks/contract"
//!
//! [poll]
//! interval_ms = 2000
//! max_attempts = 30
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{RelayError, Result};
use crate::oauth::{HttpAuthorizationServer, OAuthClientConfig, TokenBroker, HUBSPOT_TOKEN_URL};
use crate::poll::PollConfig;
use crate::record_store::{CrmRecordStore, HUBSPOT_API_BASE};
use crate::repository::{FileTokenRepository, DEFAULT_NAMESPACE};
use crate::session::{WorkflowSession, DEFAULT_REQUEST_ORIGIN};
use crate::token::{preview, DEFAULT_REFRESH_BUFFER_MS};
use crate::token_manager::TokenManager;
use crate::trigger::WebhookTrigger;

pub const ENV_CLIENT_ID: &str = "HUBSPOT_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "HUBSPOT_CLIENT_SECRET";
pub const ENV_WEBHOOK_URL: &str = "RELAY_WEBHOOK_URL";
pub const ENV_POLL_INTERVAL_MS: &str = "RELAY_POLL_INTERVAL_MS";
pub const ENV_POLL_MAX_ATTEMPTS: &str = "RELAY_POLL_MAX_ATTEMPTS";

/// Complete relay configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Prefix for token storage keys
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_refresh_buffer_ms")]
    pub refresh_buffer_ms: u64,

    #[serde(default)]
    pub oauth: OAuthSection,

    #[serde(default)]
    pub trigger: TriggerSection,

    #[serde(default)]
    pub crm: CrmSection,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub storage: StorageSection,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthSection {
    #[serde(default = "default_token_url")]
    pub token_url: String,

    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub client_secret: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
}

impl std::fmt::Debug for OAuthSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthSection")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

impl Default for OAuthSection {
    fn default() -> Self {
        Self {
            token_url: default_token_url(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSection {
    #[serde(default)]
    pub webhook_url: String,

    #[serde(default = "default_request_origin")]
    pub request_origin: String,

    /// Write trigger details back onto the record
    #[serde(default = "default_true")]
    pub stamp_record: bool,
}

impl Default for TriggerSection {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            request_origin: default_request_origin(),
            stamp_record: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmSection {
    #[serde(default = "default_api_base")]
    pub base_url: String,

    #[serde(default = "default_object_type")]
    pub object_type: String,
}

impl Default for CrmSection {
    fn default() -> Self {
        Self {
            base_url: default_api_base(),
            object_type: default_object_type(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSection {
    /// Defaults to `~/.contract-relay/tokens`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_dir: Option<PathBuf>,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_refresh_buffer_ms() -> u64 {
    DEFAULT_REFRESH_BUFFER_MS
}

fn default_token_url() -> String {
    HUBSPOT_TOKEN_URL.to_string()
}

fn default_request_origin() -> String {
    DEFAULT_REQUEST_ORIGIN.to_string()
}

fn default_api_base() -> String {
    HUBSPOT_API_BASE.to_string()
}

fn default_object_type() -> String {
    "deals".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            refresh_buffer_ms: default_refresh_buffer_ms(),
            oauth: OAuthSection::default(),
            trigger: TriggerSection::default(),
            crm: CrmSection::default(),
            poll: PollConfig::default(),
            storage: StorageSection::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| RelayError::Config(format!("Failed to parse relay TOML: {}", e)))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| RelayError::Config(format!("Failed to parse relay YAML: {}", e)))
    }

    /// Load from a `.toml`, `.yaml` or `.yml` file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("Failed to read config {:?}: {}", path, e))
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            _ => Err(RelayError::Config(format!(
                "Unsupported config format {:?}; expected .toml, .yaml or .yml",
                path
            ))),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RelayError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Empty values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get(ENV_CLIENT_ID) {
            self.oauth.client_id = v;
        }
        if let Some(v) = get(ENV_CLIENT_SECRET) {
            self.oauth.client_secret = v;
        }
        if let Some(v) = get(ENV_WEBHOOK_URL) {
            self.trigger.webhook_url = v;
        }
        if let Some(v) = get(ENV_POLL_INTERVAL_MS) {
            self.poll.interval_ms = parse_number(ENV_POLL_INTERVAL_MS, &v)?;
        }
        if let Some(v) = get(ENV_POLL_MAX_ATTEMPTS) {
            self.poll.max_attempts = parse_number(ENV_POLL_MAX_ATTEMPTS, &v)?;
        }

        Ok(self)
    }

    /// Check that everything needed to run a session is present.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.oauth.client_id.trim().is_empty() {
            problems.push("oauth.client_id is required");
        }
        if self.oauth.client_secret.trim().is_empty() {
            problems.push("oauth.client_secret is required");
        }
        if self.trigger.webhook_url.trim().is_empty() {
            problems.push("trigger.webhook_url is required");
        }
        if self.poll.interval_ms == 0 {
            problems.push("poll.interval_ms must be positive");
        }
        if self.poll.max_attempts == 0 {
            problems.push("poll.max_attempts must be positive");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(RelayError::Config(problems.join("; ")))
        }
    }

    /// Which credentials are configured, without revealing them.
    pub fn status(&self) -> ConfigStatus {
        let client_id_set = !self.oauth.client_id.trim().is_empty();
        let client_secret_set = !self.oauth.client_secret.trim().is_empty();
        let webhook_url_set = !self.trigger.webhook_url.trim().is_empty();

        ConfigStatus {
            client_id_set,
            client_secret_set,
            webhook_url_set,
            redirect_uri: self.oauth.redirect_uri.clone(),
            client_id_preview: client_id_set.then(|| preview(&self.oauth.client_id)),
            client_secret_preview: client_secret_set.then(|| preview(&self.oauth.client_secret)),
            ready_for_oauth: client_id_set && client_secret_set,
            all_configured: client_id_set && client_secret_set && webhook_url_set,
        }
    }

    pub fn oauth_client(&self) -> OAuthClientConfig {
        OAuthClientConfig {
            token_url: self.oauth.token_url.clone(),
            client_id: self.oauth.client_id.clone(),
            client_secret: self.oauth.client_secret.clone(),
            redirect_uri: self.oauth.redirect_uri.clone(),
        }
    }

    pub fn token_repository(&self) -> Result<FileTokenRepository> {
        match &self.storage.token_dir {
            Some(dir) => Ok(FileTokenRepository::new(self.namespace.clone(), dir)),
            None => FileTokenRepository::default_directory(self.namespace.clone()),
        }
    }

    /// File-backed token manager talking to the configured token endpoint.
    pub fn token_manager(&self) -> Result<TokenManager> {
        let repository = self.token_repository()?;
        repository.ensure_exists()?;

        Ok(TokenManager::new(
            Arc::new(repository),
            Arc::new(HttpAuthorizationServer::new(self.oauth_client())),
        )
        .with_buffer_ms(self.refresh_buffer_ms))
    }

    pub fn record_store(&self, broker: Arc<dyn TokenBroker>) -> CrmRecordStore {
        CrmRecordStore::new(broker)
            .with_base_url(&self.crm.base_url)
            .with_object_type(&self.crm.object_type)
    }

    /// Session wired to the configured webhook and CRM.
    pub fn session(&self, broker: Arc<dyn TokenBroker>) -> WorkflowSession {
        let store = self.record_store(Arc::clone(&broker));
        WorkflowSession::new(
            broker,
            Arc::new(WebhookTrigger::new(self.trigger.webhook_url.clone())),
            Arc::new(store),
            self.poll.clone(),
        )
        .with_request_origin(self.trigger.request_origin.clone())
        .with_stamp_record(self.trigger.stamp_record)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RelayError::Config(format!("{} must be a positive integer, got '{}'", key, value)))
}

/// Configuration health report, safe to show to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigStatus {
    pub client_id_set: bool,
    pub client_secret_set: bool,
    pub webhook_url_set: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id_preview: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_preview: Option<String>,

    pub ready_for_oauth: bool,
    pub all_configured: bool,
}
