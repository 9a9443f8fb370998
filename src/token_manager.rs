//! # Token Manager
//!
//! Hands out a valid bearer token per tenant and refreshes it transparently.
//!
//! ```text
//! get_valid_access_token(tenant)
//!   ├─ no record ............................ NotAuthorized
//!   ├─ now + buffer <  expires_at ........... cached token (no network)
//!   └─ stale
//!        ├─ (per-tenant lock, reload, recheck)
//!        ├─ no refresh token ................ NotAuthorized
//!        ├─ refresh rejected ................ RefreshFailed (record untouched)
//!        └─ refreshed ....................... overwrite record, new token
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{RelayError, Result};
use crate::oauth::{AuthorizationServer, TokenBroker};
use crate::repository::TokenRepository;
use crate::token::{TokenRecord, DEFAULT_MANUAL_EXPIRES_IN_SECS, DEFAULT_REFRESH_BUFFER_MS};

/// Cache-aside token store with refresh-on-read.
pub struct TokenManager {
    repository: Arc<dyn TokenRepository>,
    auth: Arc<dyn AuthorizationServer>,
    clock: Arc<dyn Clock>,
    buffer_ms: u64,
    refresh_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("repository", &"<TokenRepository>")
            .field("auth", &"<AuthorizationServer>")
            .field("buffer_ms", &self.buffer_ms)
            .finish()
    }
}

impl TokenManager {
    pub fn new(repository: Arc<dyn TokenRepository>, auth: Arc<dyn AuthorizationServer>) -> Self {
        Self {
            repository,
            auth,
            clock: Arc::new(SystemClock),
            buffer_ms: DEFAULT_REFRESH_BUFFER_MS,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_buffer_ms(mut self, buffer_ms: u64) -> Self {
        self.buffer_ms = buffer_ms;
        self
    }

    pub fn buffer_ms(&self) -> u64 {
        self.buffer_ms
    }

    /// Return a token that stays valid for at least the buffer window.
    pub async fn get_valid_access_token(&self, tenant_id: &str) -> Result<String> {
        let record = self.load(tenant_id).await?;
        let now = self.clock.now_ms();

        if !record.is_stale(now, self.buffer_ms) {
            debug!(
                tenant = tenant_id,
                expires_in_min = record.expires_in_ms(now) / 60_000,
                "using cached access token"
            );
            return Ok(record.access_token);
        }

        let lock = self.refresh_lock(tenant_id)?;
        let result = {
            let _guard = lock.lock().await;
            self.refresh_if_stale(tenant_id).await
        };
        self.release_lock(tenant_id, lock);
        result
    }

    async fn refresh_if_stale(&self, tenant_id: &str) -> Result<String> {
        // Another caller may have refreshed while we waited.
        let record = self.load(tenant_id).await?;
        if !record.is_stale(self.clock.now_ms(), self.buffer_ms) {
            debug!(tenant = tenant_id, "access token refreshed by concurrent caller");
            return Ok(record.access_token);
        }

        info!(tenant = tenant_id, "access token expired or expiring soon, refreshing");
        self.refresh(tenant_id, record).await
    }

    async fn refresh(&self, tenant_id: &str, stale: TokenRecord) -> Result<String> {
        let refresh_token = stale.refresh_token.clone().ok_or_else(|| {
            warn!(tenant = tenant_id, "no refresh token stored");
            RelayError::NotAuthorized(format!(
                "no refresh token available for tenant {}; reauthorization required",
                tenant_id
            ))
        })?;

        let grant = self.auth.refresh(&refresh_token).await.map_err(|e| {
            error!(tenant = tenant_id, error = %e, "token refresh failed");
            e
        })?;

        let mut updated = TokenRecord::issue(tenant_id, &grant, self.clock.now_ms());
        if updated.refresh_token.is_none() {
            updated.refresh_token = stale.refresh_token;
        }

        self.repository.put(tenant_id, &updated).await?;
        info!(
            tenant = tenant_id,
            expires_at = updated.expires_at,
            "refreshed access token"
        );

        Ok(updated.access_token)
    }

    /// Finish the authorization-code flow and store the issued tokens.
    ///
    /// Returns the tenant id reported by the authorization server.
    pub async fn complete_authorization(&self, code: &str) -> Result<String> {
        let grant = self.auth.exchange_code(code).await?;
        let tenant_id = grant.hub_id.clone().ok_or_else(|| {
            RelayError::Config("token response did not include a tenant id (hub_id)".to_string())
        })?;

        let record = TokenRecord::issue(&tenant_id, &grant, self.clock.now_ms());
        self.repository.put(&tenant_id, &record).await?;
        info!(tenant = %tenant_id, "stored tokens from authorization code exchange");

        Ok(tenant_id)
    }

    /// Install tokens obtained out of band.
    pub async fn store_tokens(
        &self,
        tenant_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in_secs: Option<u64>,
    ) -> Result<TokenRecord> {
        if tenant_id.trim().is_empty() || access_token.trim().is_empty() {
            let mut missing = Vec::new();
            if tenant_id.trim().is_empty() {
                missing.push("tenantId".to_string());
            }
            if access_token.trim().is_empty() {
                missing.push("accessToken".to_string());
            }
            return Err(RelayError::ValidationError { missing });
        }

        let now = self.clock.now_ms();
        let expires_in = expires_in_secs.unwrap_or(DEFAULT_MANUAL_EXPIRES_IN_SECS);
        let record = TokenRecord {
            tenant_id: tenant_id.to_string(),
            access_token: access_token.to_string(),
            refresh_token: refresh_token
                .filter(|t| !t.trim().is_empty())
                .map(str::to_string),
            expires_at: now.saturating_add(expires_in.saturating_mul(1000)),
            updated_at: now,
        };

        self.repository.put(tenant_id, &record).await?;
        info!(tenant = tenant_id, "tokens installed manually");
        Ok(record)
    }

    /// Administrative removal of a tenant's credentials.
    pub async fn clear(&self, tenant_id: &str) -> Result<bool> {
        let removed = self.repository.delete(tenant_id).await?;
        self.prune_lock(tenant_id);
        info!(tenant = tenant_id, removed, "cleared tokens");
        Ok(removed)
    }

    pub async fn record(&self, tenant_id: &str) -> Result<Option<TokenRecord>> {
        self.repository.get(tenant_id).await
    }

    pub async fn tenants(&self) -> Result<Vec<String>> {
        self.repository.tenants().await
    }

    async fn load(&self, tenant_id: &str) -> Result<TokenRecord> {
        self.repository.get(tenant_id).await?.ok_or_else(|| {
            RelayError::NotAuthorized(format!(
                "no token found for tenant {}; the app needs to be installed",
                tenant_id
            ))
        })
    }

    fn refresh_lock(&self, tenant_id: &str) -> Result<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .refresh_locks
            .lock()
            .map_err(|_| RelayError::Storage("refresh lock table poisoned".to_string()))?;
        Ok(Arc::clone(
            locks
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        ))
    }

    fn release_lock(&self, tenant_id: &str, lock: Arc<AsyncMutex<()>>) {
        drop(lock);
        self.prune_lock(tenant_id);
    }

    /// Forget the tenant's lock unless a caller still holds or awaits it.
    fn prune_lock(&self, tenant_id: &str) {
        if let Ok(mut locks) = self.refresh_locks.lock() {
            if locks
                .get(tenant_id)
                .is_some_and(|lock| Arc::strong_count(lock) == 1)
            {
                locks.remove(tenant_id);
            }
        }
    }
}

#[async_trait]
impl TokenBroker for TokenManager {
    async fn access_token(&self, tenant_id: &str) -> Result<String> {
        self.get_valid_access_token(tenant_id).await
    }

    async fn is_connected(&self, tenant_id: &str) -> bool {
        matches!(self.repository.get(tenant_id).await, Ok(Some(_)))
    }
}
