//! Credential store
//!
//! Owns the persisted credential inside the config blob. API keys are
//! hashed before they touch the backend, whatever the caller handed in;
//! the plaintext never lingers past this boundary.

use std::sync::Arc;

use lanonasis_core::domain::credential::{is_hashed, sha256_hex};
use lanonasis_core::domain::Credential;
use lanonasis_core::error::BrokerResult;
use tracing::{debug, info};

use crate::config_store::ConfigStore;

/// Store for the single active credential.
pub struct CredentialStore {
    config: Arc<ConfigStore>,
}

impl CredentialStore {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config }
    }

    /// The active credential, if any.
    pub async fn get(&self) -> BrokerResult<Option<Credential>> {
        Ok(self.config.load().await?.credentials)
    }

    /// Replace the active credential.
    ///
    /// Defends the hash invariant even against hand-built values: an
    /// `ApiKey` whose hash field is not 64-hex is re-hashed here.
    pub async fn set(&self, credential: Credential) -> BrokerResult<()> {
        let credential = enforce_hashed(credential);
        debug!("[CredentialStore] Storing {} credential", credential.kind());
        self.config
            .update(|config| config.credentials = Some(credential))
            .await?;
        Ok(())
    }

    /// Remove the active credential (sign-out).
    pub async fn clear(&self) -> BrokerResult<()> {
        info!("[CredentialStore] Clearing active credential");
        self.config
            .update(|config| config.credentials = None)
            .await?;
        Ok(())
    }

    /// Replace the credential as part of a rotation. Identical to `set`
    /// except the intent is logged; the config save already preserves the
    /// prior blob as a backup.
    pub async fn rotate(&self, credential: Credential) -> BrokerResult<()> {
        info!(
            "[CredentialStore] Rotating to {} credential",
            credential.kind()
        );
        self.set(credential).await
    }

    /// Whether the backing store round-trips. Used by diagnostics; never
    /// errors.
    pub async fn export_healthy(&self) -> bool {
        match self.config.load().await {
            Ok(config) => self.config.save(&config).await.is_ok(),
            Err(_) => false,
        }
    }
}

fn enforce_hashed(credential: Credential) -> Credential {
    match credential {
        Credential::ApiKey { hash } if !is_hashed(&hash) => Credential::ApiKey {
            hash: sha256_hex(&hash),
        },
        other => other,
    }
}
