//! Storage backends
//!
//! The broker persists everything through a three-method capability so the
//! host can supply its own secret storage (IDE extensions do). The file
//! backend is the default: atomic temp-then-rename writes, restrictive
//! permissions, and timestamped sibling backups.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use lanonasis_core::error::{BrokerError, BrokerResult};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Minimal storage capability the broker depends on.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a value; `None` when the key was never written.
    async fn read(&self, key: &str) -> BrokerResult<Option<String>>;

    /// Write a value atomically.
    async fn write(&self, key: &str, value: &str) -> BrokerResult<()>;

    /// Delete a value; deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> BrokerResult<()>;

    /// Move the current value aside as a timestamped backup, returning the
    /// backup name. Backends without a durable medium may return `None`.
    async fn backup(&self, _key: &str) -> BrokerResult<Option<String>> {
        Ok(None)
    }

    /// List backup names for a key, newest first.
    async fn list_backups(&self, _key: &str) -> BrokerResult<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Plain-file backend rooted in a directory.
///
/// Keys are file names inside the root. Writes go to a `.tmp` sibling and
/// rename over the target so readers observe either the old or the new
/// blob, never a torn one.
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Backend rooted at the platform config directory.
    pub fn at_default_location() -> Option<Self> {
        crate::default_config_dir().map(Self::new)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Backup file name for a key: `config.json` -> `config.backup.<iso>`.
    fn backup_name(key: &str) -> String {
        let stem = key.strip_suffix(".json").unwrap_or(key);
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        format!("{}.backup.{}", stem, stamp)
    }

    fn backup_prefix(key: &str) -> String {
        let stem = key.strip_suffix(".json").unwrap_or(key);
        format!("{}.backup.", stem)
    }

    async fn ensure_root(&self) -> BrokerResult<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| BrokerError::StorageUnwritable(format!("create {:?}: {}", self.root, e)))
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn read(&self, key: &str) -> BrokerResult<Option<String>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BrokerError::StorageUnwritable(format!(
                "read {:?}: {}",
                path, e
            ))),
        }
    }

    async fn write(&self, key: &str, value: &str) -> BrokerResult<()> {
        self.ensure_root().await?;
        let path = self.path_for(key);
        let tmp = self.root.join(format!("{}.tmp", key));

        tokio::fs::write(&tmp, value)
            .await
            .map_err(|e| BrokerError::StorageUnwritable(format!("write {:?}: {}", tmp, e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp, perms).await.map_err(|e| {
                BrokerError::StorageUnwritable(format!("chmod {:?}: {}", tmp, e))
            })?;
        }

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| BrokerError::StorageUnwritable(format!("rename to {:?}: {}", path, e)))?;

        debug!("[Storage] Wrote {:?} atomically", path);
        Ok(())
    }

    async fn delete(&self, key: &str) -> BrokerResult<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BrokerError::StorageUnwritable(format!(
                "delete {:?}: {}",
                path, e
            ))),
        }
    }

    async fn backup(&self, key: &str) -> BrokerResult<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let backup_name = Self::backup_name(key);
        let backup_path = self.root.join(&backup_name);
        tokio::fs::copy(&path, &backup_path).await.map_err(|e| {
            BrokerError::StorageUnwritable(format!("backup to {:?}: {}", backup_path, e))
        })?;
        debug!("[Storage] Backed up {:?} as {}", path, backup_name);
        Ok(Some(backup_name))
    }

    async fn list_backups(&self, key: &str) -> BrokerResult<Vec<String>> {
        let prefix = Self::backup_prefix(key);
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => {
                warn!("[Storage] Cannot list backups: {}", e);
                return Ok(names);
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(&prefix) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        names.reverse();
        Ok(names)
    }
}

/// In-memory backend for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryBackend {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn read(&self, key: &str) -> BrokerResult<Option<String>> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> BrokerResult<()> {
        self.values
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> BrokerResult<()> {
        self.values.write().await.remove(key);
        Ok(())
    }
}
