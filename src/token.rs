//! # Token Records
//!
//! The persisted OAuth credential pair for one tenant, and the token endpoint
//! response it is built from.

use serde::{Deserialize, Deserializer, Serialize};

/// Tokens are treated as stale this long before they actually expire.
pub const DEFAULT_REFRESH_BUFFER_MS: u64 = 5 * 60 * 1000;

/// Lifetime assumed for manually installed tokens when none is given.
pub const DEFAULT_MANUAL_EXPIRES_IN_SECS: u64 = 21_600;

/// Stored credentials for one tenant.
///
/// A refresh replaces every field; records are never patched in place.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub tenant_id: String,

    pub access_token: String,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "non_empty"
    )]
    pub refresh_token: Option<String>,

    /// Epoch milliseconds after which `access_token` must not be used.
    pub expires_at: u64,

    /// Epoch milliseconds of the last write.
    pub updated_at: u64,
}

impl TokenRecord {
    /// Build a record from a freshly issued grant.
    pub fn issue(tenant_id: impl Into<String>, grant: &TokenGrant, now_ms: u64) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            access_token: grant.access_token.clone(),
            refresh_token: grant
                .refresh_token
                .clone()
                .filter(|t| !t.trim().is_empty()),
            expires_at: now_ms.saturating_add(grant.expires_in.saturating_mul(1000)),
            updated_at: now_ms,
        }
    }

    /// A token is stale once `now + buffer` reaches `expires_at`.
    pub fn is_stale(&self, now_ms: u64, buffer_ms: u64) -> bool {
        now_ms.saturating_add(buffer_ms) >= self.expires_at
    }

    /// Remaining lifetime in milliseconds, zero when already expired.
    pub fn expires_in_ms(&self, now_ms: u64) -> u64 {
        self.expires_at.saturating_sub(now_ms)
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.is_some()
    }
}

impl std::fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRecord")
            .field("tenant_id", &self.tenant_id)
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Token endpoint response for either grant type.
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Lifetime in seconds
    pub expires_in: u64,

    /// Tenant (portal) id, returned by HubSpot on code exchange
    #[serde(default, deserialize_with = "string_or_number")]
    pub hub_id: Option<String>,

    #[serde(default)]
    pub token_type: Option<String>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_in", &self.expires_in)
            .field("hub_id", &self.hub_id)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Short, log-safe preview of a secret.
pub fn preview(secret: &str) -> String {
    let head: String = secret.chars().take(10).collect();
    format!("{}...", head)
}

fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
