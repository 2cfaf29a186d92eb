//! Lanonasis Storage Layer
//!
//! Persists the broker configuration and the active credential behind a
//! small storage capability.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  CredentialStore                     │
//! │      (hash-before-persist, rotation, migration)      │
//! ├──────────────────────────────────────────────────────┤
//! │                    ConfigStore                       │
//! │   (schema versioning, backups, corruption repair)    │
//! ├──────────────────────────────────────────────────────┤
//! │                  StorageBackend                      │
//! │   FileBackend (atomic rename) / KeychainBackend /    │
//! │              MemoryBackend (tests)                   │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod config_store;
pub mod credential_store;
pub mod keychain;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use config_store::{ConfigStore, RepairOutcome};
pub use credential_store::CredentialStore;
pub use keychain::KeychainBackend;

/// Get the default config directory for the current platform.
pub fn default_config_dir() -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|p| p.join("lanonasis"))
}
