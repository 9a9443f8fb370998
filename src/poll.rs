//! # Completion Polling
//!
//! Bounded polling for a result written asynchronously by an external
//! workflow. Scheduling goes through [`Scheduler`] so the loop can be driven
//! by tokio's timer, a paused test clock, or anything else.
//!
//! Iterations are strictly sequential: the next wake-up is only armed after
//! the previous read has completed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::record_store::{FieldMap, RecordStore};

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 30;
pub const DEFAULT_COMPLETION_FIELD: &str = "luminance_contract_url";

/// Polling budget and the fields that signal completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Field whose presence means the workflow finished
    #[serde(default = "default_completion_field")]
    pub completion_field: String,

    /// Fields read on each attempt; always includes `completion_field`
    #[serde(default = "default_status_fields")]
    pub status_fields: Vec<String>,
}

fn default_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_POLL_ATTEMPTS
}

fn default_completion_field() -> String {
    DEFAULT_COMPLETION_FIELD.to_string()
}

fn default_status_fields() -> Vec<String> {
    vec![
        DEFAULT_COMPLETION_FIELD.to_string(),
        "luminance_contract_id".to_string(),
        "luminance_contract_status".to_string(),
    ]
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_attempts: default_max_attempts(),
            completion_field: default_completion_field(),
            status_fields: default_status_fields(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Longest a session can spend polling.
    pub fn max_wait(&self) -> Duration {
        self.interval() * self.max_attempts
    }

    /// Fields to read, with the completion field guaranteed present.
    pub fn read_fields(&self) -> Vec<String> {
        let mut fields = self.status_fields.clone();
        if !fields.contains(&self.completion_field) {
            fields.insert(0, self.completion_field.clone());
        }
        fields
    }
}

/// Delay source for the poll loop.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Scheduler backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// How a poll loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Succeeded {
        value: String,
        fields: FieldMap,
        attempts: u32,
    },
    TimedOut {
        attempts: u32,
    },
}

impl PollOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. } | Self::TimedOut { attempts } => *attempts,
        }
    }

    /// The completion value, or `TimedOut` as an error.
    pub fn into_result(self) -> Result<String> {
        match self {
            Self::Succeeded { value, .. } => Ok(value),
            Self::TimedOut { attempts } => Err(RelayError::TimedOut { attempts }),
        }
    }
}

/// Bounded reader of a record's completion field.
pub struct Poller {
    store: Arc<dyn RecordStore>,
    scheduler: Arc<dyn Scheduler>,
    config: PollConfig,
}

impl Poller {
    pub fn new(
        store: Arc<dyn RecordStore>,
        scheduler: Arc<dyn Scheduler>,
        config: PollConfig,
    ) -> Self {
        Self {
            store,
            scheduler,
            config,
        }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Read the status fields once.
    pub async fn check(&self, tenant_id: &str, target_id: &str) -> Result<Option<(String, FieldMap)>> {
        let fields = self
            .store
            .read_fields(tenant_id, target_id, &self.config.read_fields())
            .await?;

        Ok(fields
            .get(&self.config.completion_field)
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .map(|value| (value, fields)))
    }

    /// Poll until the completion field appears or the budget runs out.
    ///
    /// `on_attempt` is called after every read that did not find the result,
    /// with the attempt number (1-based). Read errors count as attempts and
    /// are otherwise ignored.
    pub async fn run<F>(&self, tenant_id: &str, target_id: &str, mut on_attempt: F) -> PollOutcome
    where
        F: FnMut(u32) + Send,
    {
        let max_attempts = self.config.max_attempts;
        let interval = self.config.interval();

        for attempt in 1..=max_attempts {
            self.scheduler.sleep(interval).await;

            match self.check(tenant_id, target_id).await {
                Ok(Some((value, fields))) => {
                    debug!(record = target_id, attempt, "completion field observed");
                    return PollOutcome::Succeeded {
                        value,
                        fields,
                        attempts: attempt,
                    };
                }
                Ok(None) => {
                    debug!(record = target_id, attempt, max_attempts, "result still pending");
                }
                Err(e) => {
                    warn!(record = target_id, attempt, error = %e, "status read failed, continuing");
                }
            }

            on_attempt(attempt);
        }

        PollOutcome::TimedOut {
            attempts: max_attempts,
        }
    }
}
