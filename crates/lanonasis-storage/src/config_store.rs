//! Versioned configuration store
//!
//! Loads and saves the broker config blob through a storage backend.
//! Every structural save moves the prior good copy aside as a timestamped
//! backup first; a blob that fails to parse can be repaired by renaming it
//! out of the way and recreating an empty config.

use std::sync::Arc;

use lanonasis_core::defaults::CONFIG_FILE;
use lanonasis_core::domain::BrokerConfig;
use lanonasis_core::error::{BrokerError, BrokerResult};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::backend::StorageBackend;

/// Result of a corruption repair attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairOutcome {
    /// Backup holding the corrupt bytes, when the backend persists backups.
    pub corrupt_backup: Option<String>,
    /// Whether a fresh config was written.
    pub recreated: bool,
}

/// Store for the persisted `BrokerConfig`.
///
/// Writes are serialized through an internal lock so concurrent savers
/// cannot interleave backup and rename; readers see either the old or the
/// new blob.
pub struct ConfigStore {
    backend: Arc<dyn StorageBackend>,
    key: String,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            key: CONFIG_FILE.to_string(),
            write_lock: Mutex::new(()),
        }
    }

    /// Custom blob key (for hosts that share a backend between profiles).
    pub fn with_key(backend: Arc<dyn StorageBackend>, key: impl Into<String>) -> Self {
        Self {
            backend,
            key: key.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the config, upgrading legacy blobs.
    ///
    /// An upgraded blob is rewritten immediately (behind a backup) so the
    /// plaintext a legacy client may have left never survives the first
    /// read. A missing blob yields a fresh config without writing.
    pub async fn load(&self) -> BrokerResult<BrokerConfig> {
        let raw = match self.backend.read(&self.key).await? {
            Some(raw) => raw,
            None => return Ok(BrokerConfig::new()),
        };

        let (config, migrated) = BrokerConfig::from_blob(&raw)?;
        if migrated {
            info!("[Config] Upgraded legacy config blob; rewriting");
            self.save(&config).await?;
        }
        Ok(config)
    }

    /// Whether a blob exists at all.
    pub async fn exists(&self) -> BrokerResult<bool> {
        Ok(self.backend.read(&self.key).await?.is_some())
    }

    /// Persist the config, backing up the prior copy first.
    pub async fn save(&self, config: &BrokerConfig) -> BrokerResult<()> {
        let _guard = self.write_lock.lock().await;
        self.backend.backup(&self.key).await?;
        let blob = serde_json::to_string_pretty(config)
            .map_err(|e| BrokerError::StorageUnwritable(format!("serialize config: {}", e)))?;
        self.backend.write(&self.key, &blob).await
    }

    /// Delete the blob (sign-out / reset). Backups are kept.
    pub async fn clear(&self) -> BrokerResult<()> {
        let _guard = self.write_lock.lock().await;
        self.backend.delete(&self.key).await
    }

    /// Newest-first backup names, when the backend keeps them.
    pub async fn backups(&self) -> BrokerResult<Vec<String>> {
        self.backend.list_backups(&self.key).await
    }

    /// Rename a corrupt blob aside and recreate an empty config.
    ///
    /// Safe to call on a healthy store: when the blob parses, nothing is
    /// touched and `recreated` is false.
    pub async fn repair(&self) -> BrokerResult<RepairOutcome> {
        let raw = self.backend.read(&self.key).await?;
        let healthy = match raw {
            None => true,
            Some(raw) => BrokerConfig::from_blob(&raw).is_ok(),
        };
        if healthy {
            return Ok(RepairOutcome {
                corrupt_backup: None,
                recreated: false,
            });
        }

        warn!("[Config] Blob is corrupt; backing it up and recreating");
        let _guard = self.write_lock.lock().await;
        let corrupt_backup = self.backend.backup(&self.key).await?;
        let fresh = BrokerConfig::new();
        let blob = serde_json::to_string_pretty(&fresh)
            .map_err(|e| BrokerError::StorageUnwritable(format!("serialize config: {}", e)))?;
        self.backend.write(&self.key, &blob).await?;
        Ok(RepairOutcome {
            corrupt_backup,
            recreated: true,
        })
    }

    /// Read-modify-write helper holding the write lock across the update.
    pub async fn update<F>(&self, mutate: F) -> BrokerResult<BrokerConfig>
    where
        F: FnOnce(&mut BrokerConfig),
    {
        let mut config = self.load().await?;
        mutate(&mut config);
        self.save(&config).await?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileBackend, MemoryBackend};
    use lanonasis_core::domain::{Credential, McpPreference};
    use tempfile::TempDir;

    fn memory_store() -> ConfigStore {
        ConfigStore::new(Arc::new(MemoryBackend::new()))
    }

    #[tokio::test]
    async fn test_load_missing_yields_fresh_config() {
        let store = memory_store();
        let config = store.load().await.unwrap();
        assert_eq!(config, BrokerConfig::new());
        // Nothing was written
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let store = memory_store();
        let mut config = BrokerConfig::new();
        config.credentials = Some(Credential::api_key("key"));
        config.mcp_preference = McpPreference::Local;
        store.save(&config).await.unwrap();
        assert_eq!(store.load().await.unwrap(), config);
    }

    #[tokio::test]
    async fn test_legacy_blob_rewritten_on_load() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .write(CONFIG_FILE, r#"{"apiKey": "plaintext-key"}"#)
            .await
            .unwrap();
        let store = ConfigStore::new(backend.clone());

        let config = store.load().await.unwrap();
        assert!(config.credentials.is_some());

        let rewritten = backend.read(CONFIG_FILE).await.unwrap().unwrap();
        assert!(!rewritten.contains("plaintext-key"));
        assert!(rewritten.contains("\"version\""));
    }

    #[tokio::test]
    async fn test_corrupt_blob_fails_with_storage_corrupted() {
        let backend = Arc::new(MemoryBackend::new());
        backend.write(CONFIG_FILE, "garbage{{").await.unwrap();
        let store = ConfigStore::new(backend);
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, BrokerError::StorageCorrupted(_)));
    }

    #[tokio::test]
    async fn test_repair_recreates_and_backs_up() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path()));
        backend.write(CONFIG_FILE, "garbage{{").await.unwrap();
        let store = ConfigStore::new(backend.clone());

        let outcome = store.repair().await.unwrap();
        assert!(outcome.recreated);
        let backup = outcome.corrupt_backup.unwrap();

        // Original bytes preserved in the backup
        let backed_up = tokio::fs::read_to_string(dir.path().join(&backup))
            .await
            .unwrap();
        assert_eq!(backed_up, "garbage{{");

        // Fresh config parses
        let config = store.load().await.unwrap();
        assert_eq!(config, BrokerConfig::new());
    }

    #[tokio::test]
    async fn test_repair_is_a_noop_on_healthy_store() {
        let store = memory_store();
        store.save(&BrokerConfig::new()).await.unwrap();
        let outcome = store.repair().await.unwrap();
        assert!(!outcome.recreated);
        assert!(outcome.corrupt_backup.is_none());
    }

    #[tokio::test]
    async fn test_save_creates_backup_of_prior_copy() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FileBackend::new(dir.path()));
        let store = ConfigStore::new(backend);

        store.save(&BrokerConfig::new()).await.unwrap();
        let mut second = BrokerConfig::new();
        second.credentials = Some(Credential::api_key("key"));
        store.save(&second).await.unwrap();

        let backups = store.backups().await.unwrap();
        assert_eq!(backups.len(), 1);
        assert!(backups[0].starts_with("config.backup."));
    }

    #[tokio::test]
    async fn test_update_applies_mutation() {
        let store = memory_store();
        let updated = store
            .update(|c| c.mcp_preference = McpPreference::Cli)
            .await
            .unwrap();
        assert_eq!(updated.mcp_preference, McpPreference::Cli);
        assert_eq!(store.load().await.unwrap().mcp_preference, McpPreference::Cli);
    }
}
