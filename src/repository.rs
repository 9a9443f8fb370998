//! # Token Repository
//!
//! Key-value persistence for [`TokenRecord`]s. Each record lives under
//! `"<namespace>:tokens:<tenant_id>"` as JSON text, with no secondary index.
//!
//! Writes are last-write-wins. Nothing here serializes concurrent writers;
//! the token manager does that for refreshes within one process.
//!
//! # Directory Layout
//!
//! ```text
//! ~/.contract-relay/tokens/
//! ├── hubspot_tokens_147788687.json
//! └── hubspot_tokens_20455112.json
//! ```

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{RelayError, Result};
use crate::token::TokenRecord;

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "hubspot";

/// Default token directory name under the home directory
pub const TOKEN_DIR: &str = "tokens";

/// Storage key for a tenant's record.
pub fn storage_key(namespace: &str, tenant_id: &str) -> String {
    format!("{}:tokens:{}", namespace, tenant_id)
}

/// Persistence capability injected into the token manager.
#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn get(&self, tenant_id: &str) -> Result<Option<TokenRecord>>;

    /// Replace the tenant's record in full.
    async fn put(&self, tenant_id: &str, record: &TokenRecord) -> Result<()>;

    /// Remove the tenant's record. Returns whether one existed.
    async fn delete(&self, tenant_id: &str) -> Result<bool>;

    /// Tenants that currently have a stored record.
    async fn tenants(&self) -> Result<Vec<String>>;
}

/// Process-local repository holding serialized records.
#[derive(Debug)]
pub struct InMemoryTokenRepository {
    namespace: String,
    entries: RwLock<HashMap<String, String>>,
}

impl Default for InMemoryTokenRepository {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

impl InMemoryTokenRepository {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Stored JSON text for a tenant, exactly as written.
    pub fn raw(&self, tenant_id: &str) -> Option<String> {
        let key = storage_key(&self.namespace, tenant_id);
        self.entries.read().ok()?.get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> RelayError {
        RelayError::Storage("token map lock poisoned".to_string())
    }
}

#[async_trait]
impl TokenRepository for InMemoryTokenRepository {
    async fn get(&self, tenant_id: &str) -> Result<Option<TokenRecord>> {
        let key = storage_key(&self.namespace, tenant_id);
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        match entries.get(&key) {
            Some(text) => Ok(Some(serde_json::from_str(text)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, tenant_id: &str, record: &TokenRecord) -> Result<()> {
        let key = storage_key(&self.namespace, tenant_id);
        let text = serde_json::to_string(record)?;
        self.entries
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(key, text);
        Ok(())
    }

    async fn delete(&self, tenant_id: &str) -> Result<bool> {
        let key = storage_key(&self.namespace, tenant_id);
        Ok(self
            .entries
            .write()
            .map_err(|_| Self::poisoned())?
            .remove(&key)
            .is_some())
    }

    async fn tenants(&self) -> Result<Vec<String>> {
        let prefix = storage_key(&self.namespace, "");
        let entries = self.entries.read().map_err(|_| Self::poisoned())?;
        let mut tenants: Vec<String> = entries
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect();
        tenants.sort();
        Ok(tenants)
    }
}

/// Repository storing one JSON file per key.
#[derive(Debug, Clone)]
pub struct FileTokenRepository {
    namespace: String,
    token_dir: PathBuf,
}

impl FileTokenRepository {
    pub fn new<P: AsRef<Path>>(namespace: impl Into<String>, token_dir: P) -> Self {
        Self {
            namespace: namespace.into(),
            token_dir: token_dir.as_ref().to_path_buf(),
        }
    }

    /// Repository under `~/.contract-relay/tokens`
    pub fn default_directory(namespace: impl Into<String>) -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            RelayError::Config("Could not determine home directory".to_string())
        })?;

        Ok(Self::new(
            namespace,
            home.join(".contract-relay").join(TOKEN_DIR),
        ))
    }

    pub fn token_dir(&self) -> &Path {
        &self.token_dir
    }

    pub fn exists(&self) -> bool {
        self.token_dir.exists() && self.token_dir.is_dir()
    }

    /// Create the token directory if needed
    pub fn ensure_exists(&self) -> Result<()> {
        if !self.token_dir.exists() {
            std::fs::create_dir_all(&self.token_dir).map_err(|e| {
                RelayError::Storage(format!(
                    "Failed to create token directory {:?}: {}",
                    self.token_dir, e
                ))
            })?;
        }
        Ok(())
    }

    /// File holding the record for `tenant_id`.
    ///
    /// Distinct tenant ids always map to distinct files, also on
    /// case-insensitive filesystems.
    pub fn record_path(&self, tenant_id: &str) -> PathBuf {
        self.token_dir
            .join(format!("{}{}.json", self.file_prefix(), encode_component(tenant_id)))
    }

    fn file_prefix(&self) -> String {
        format!("{}_tokens_", encode_component(&self.namespace))
    }
}

/// Reversible file-name encoding: `[a-z0-9.-]` pass through, every other
/// byte becomes `_XX` (uppercase hex).
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' => out.push(byte as char),
            _ => out.push_str(&format!("_{:02X}", byte)),
        }
    }
    out
}

#[async_trait]
impl TokenRepository for FileTokenRepository {
    async fn get(&self, tenant_id: &str) -> Result<Option<TokenRecord>> {
        let path = self.record_path(tenant_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record = serde_json::from_str(&content).map_err(|e| {
            RelayError::Storage(format!("Failed to parse token record {:?}: {}", path, e))
        })?;
        Ok(Some(record))
    }

    async fn put(&self, tenant_id: &str, record: &TokenRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.token_dir).await.map_err(|e| {
            RelayError::Storage(format!(
                "Failed to create token directory {:?}: {}",
                self.token_dir, e
            ))
        })?;

        let path = self.record_path(tenant_id);
        let dir = self.token_dir.clone();
        let bytes = serde_json::to_vec(record)?;

        // Each write gets its own temp file; the rename makes it last-write-wins.
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&bytes)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| RelayError::Storage(format!("token write task failed: {}", e)))??;

        Ok(())
    }

    async fn delete(&self, tenant_id: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.record_path(tenant_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn tenants(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.token_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let prefix = self.file_prefix();
        let mut tenants = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(&prefix) || !name.ends_with(".json") {
                continue;
            }

            let parsed = match tokio::fs::read_to_string(&path).await {
                Ok(content) => serde_json::from_str::<TokenRecord>(&content).map_err(RelayError::from),
                Err(e) => Err(RelayError::from(e)),
            };
            match parsed {
                Ok(record) => tenants.push(record.tenant_id),
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "skipping unreadable token record");
                }
            }
        }

        tenants.sort();
        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenGrant;
    use tempfile::tempdir;

    fn record(tenant: &str, access: &str) -> TokenRecord {
        let grant = TokenGrant {
            access_token: access.to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_in: 1800,
            hub_id: None,
            token_type: None,
        };
        TokenRecord::issue(tenant, &grant, 1_000)
    }

    #[test]
    fn test_storage_key_layout() {
        assert_eq!(storage_key("hubspot", "147788687"), "hubspot:tokens:147788687");
    }

    #[tokio::test]
    async fn test_in_memory_round_trip_is_identical() {
        let repo = InMemoryTokenRepository::default();
        let written = record("147788687", "access-a");

        repo.put("147788687", &written).await.unwrap();
        let read = repo.get("147788687").await.unwrap().unwrap();

        assert_eq!(read, written);
        assert!(repo.raw("147788687").unwrap().contains("\"accessToken\":\"access-a\""));
    }

    #[tokio::test]
    async fn test_in_memory_put_overwrites() {
        let repo = InMemoryTokenRepository::default();
        repo.put("t", &record("t", "first")).await.unwrap();
        repo.put("t", &record("t", "second")).await.unwrap();

        assert_eq!(repo.len(), 1);
        assert_eq!(repo.get("t").await.unwrap().unwrap().access_token, "second");
    }

    #[tokio::test]
    async fn test_in_memory_delete_and_tenants() {
        let repo = InMemoryTokenRepository::new("acme");
        repo.put("b", &record("b", "x")).await.unwrap();
        repo.put("a", &record("a", "y")).await.unwrap();

        assert_eq!(repo.tenants().await.unwrap(), vec!["a", "b"]);
        assert!(repo.delete("a").await.unwrap());
        assert!(!repo.delete("a").await.unwrap());
        assert!(repo.get("a").await.unwrap().is_none());
        assert_eq!(repo.tenants().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let temp_dir = tempdir().unwrap();
        let repo = FileTokenRepository::new("hubspot", temp_dir.path().join("tokens"));
        let written = record("147788687", "access-a");

        repo.put("147788687", &written).await.unwrap();

        assert!(repo.record_path("147788687").ends_with("hubspot_tokens_147788687.json"));
        assert_eq!(repo.get("147788687").await.unwrap().unwrap(), written);
    }

    #[tokio::test]
    async fn test_file_missing_record_is_none() {
        let temp_dir = tempdir().unwrap();
        let repo = FileTokenRepository::new("hubspot", temp_dir.path());
        assert!(repo.get("nobody").await.unwrap().is_none());
        assert!(!repo.delete("nobody").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_tenants_skips_other_namespaces() {
        let temp_dir = tempdir().unwrap();
        let hubspot = FileTokenRepository::new("hubspot", temp_dir.path());
        let other = FileTokenRepository::new("salesforce", temp_dir.path());

        hubspot.put("1", &record("1", "a")).await.unwrap();
        hubspot.put("2", &record("2", "b")).await.unwrap();
        other.put("3", &record("3", "c")).await.unwrap();
        std::fs::write(temp_dir.path().join("hubspot_tokens_broken.json"), "{").unwrap();

        assert_eq!(hubspot.tenants().await.unwrap(), vec!["1", "2"]);
        assert!(hubspot.delete("1").await.unwrap());
        assert_eq!(hubspot.tenants().await.unwrap(), vec!["2"]);
    }

    #[tokio::test]
    async fn test_file_tenant_ids_never_share_a_file() {
        let temp_dir = tempdir().unwrap();
        let repo = FileTokenRepository::new("hubspot", temp_dir.path());

        repo.put("acme/1", &record("acme/1", "token-for-slash")).await.unwrap();
        repo.put("acme_1", &record("acme_1", "token-for-underscore")).await.unwrap();
        repo.put("ACME_1", &record("ACME_1", "token-for-upper")).await.unwrap();

        let slash = repo.get("acme/1").await.unwrap().unwrap();
        assert_eq!(slash.tenant_id, "acme/1");
        assert_eq!(slash.access_token, "token-for-slash");
        assert_eq!(
            repo.get("acme_1").await.unwrap().unwrap().access_token,
            "token-for-underscore"
        );
        assert_eq!(repo.tenants().await.unwrap(), vec!["ACME_1", "acme/1", "acme_1"]);
        assert_ne!(
            repo.record_path("acme_1").to_string_lossy().to_lowercase(),
            repo.record_path("ACME_1").to_string_lossy().to_lowercase()
        );
    }

    #[test]
    fn test_encoded_names_stay_inside_token_dir() {
        let repo = FileTokenRepository::new("hubspot", "/tmp/tokens");
        let path = repo.record_path("../../etc/passwd");

        assert_eq!(path.parent().unwrap(), Path::new("/tmp/tokens"));
        assert_eq!(
            path.file_name().unwrap(),
            "hubspot_tokens_.._2F.._2Fetc_2Fpasswd.json"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_all_succeed() {
        let temp_dir = tempdir().unwrap();
        let repo = std::sync::Arc::new(FileTokenRepository::new("hubspot", temp_dir.path()));

        let handles: Vec<_> = (0..200)
            .map(|i| {
                let repo = repo.clone();
                tokio::spawn(async move {
                    repo.put("147788687", &record("147788687", &format!("access-{}", i)))
                        .await
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = repo.get("147788687").await.unwrap().unwrap();
        assert!(stored.access_token.starts_with("access-"));

        let leftovers = std::fs::read_dir(temp_dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_ensure_exists() {
        let temp_dir = tempdir().unwrap();
        let repo = FileTokenRepository::new("hubspot", temp_dir.path().join("new_tokens"));
        assert!(!repo.exists());

        repo.ensure_exists().unwrap();
        assert!(repo.exists());
    }
}
