//! OS keychain storage backend
//!
//! Uses the platform-native secure storage:
//! - Windows: Credential Manager
//! - macOS: Keychain
//! - Linux: Secret Service (GNOME Keyring, KWallet)

use async_trait::async_trait;
use keyring::Entry;
use lanonasis_core::defaults;
use lanonasis_core::error::{BrokerError, BrokerResult};
use tracing::{debug, warn};

use crate::backend::StorageBackend;

/// Keychain-backed storage. Each key becomes one keychain entry under the
/// broker's service name.
pub struct KeychainBackend {
    service: String,
}

impl KeychainBackend {
    pub fn new() -> Self {
        Self {
            service: defaults::KEYCHAIN_SERVICE.to_string(),
        }
    }

    /// Create with a custom service name (for testing).
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> BrokerResult<Entry> {
        Entry::new(&self.service, key)
            .map_err(|e| BrokerError::StorageUnwritable(format!("keychain entry {}: {}", key, e)))
    }
}

impl Default for KeychainBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for KeychainBackend {
    async fn read(&self, key: &str) -> BrokerResult<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => {
                debug!("[Keychain] Read entry {}", key);
                Ok(Some(value))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => {
                warn!("[Keychain] Read error for {}: {:?}", key, e);
                Err(BrokerError::StorageUnwritable(format!(
                    "keychain read {}: {}",
                    key, e
                )))
            }
        }
    }

    async fn write(&self, key: &str, value: &str) -> BrokerResult<()> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| BrokerError::StorageUnwritable(format!("keychain write {}: {}", key, e)))
    }

    async fn delete(&self, key: &str) -> BrokerResult<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(BrokerError::StorageUnwritable(format!(
                "keychain delete {}: {}",
                key, e
            ))),
        }
    }
}
