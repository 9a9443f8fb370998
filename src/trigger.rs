use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error};

use crate::error::{RelayError, Result};

/// Starts the external asynchronous workflow.
#[async_trait]
pub trait TriggerEndpoint: Send + Sync {
    /// Fire the trigger. Returns the upstream body, which callers only log.
    async fn fire(&self, body: &Value, access_token: &str) -> Result<Value>;
}

/// Trigger backed by a fixed webhook URL.
pub struct WebhookTrigger {
    http: reqwest::Client,
    url: String,
}

impl WebhookTrigger {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TriggerEndpoint for WebhookTrigger {
    async fn fire(&self, body: &Value, access_token: &str) -> Result<Value> {
        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(access_token)
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            error!(status = status.as_u16(), body = %text, "workflow trigger rejected");
            return Err(RelayError::TriggerFailed {
                status: status.as_u16(),
                body: text,
            });
        }

        debug!(status = status.as_u16(), "workflow trigger accepted");
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}
