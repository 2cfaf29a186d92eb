//! # Lanonasis Credential & Transport Broker
//!
//! Client-side broker for the Lanonasis Memory-as-a-Service platform:
//! obtains, persists, refreshes, and presents user credentials against
//! the OAuth 2.0 + PKCE auth gateway, and multiplexes outbound requests
//! over REST, SSE, WebSocket, a local stdio MCP server, or the wrapping
//! CLI while exposing a single observable contract.
//!
//! All state hangs off one [`Broker`] handle; collaborators receive
//! their dependencies explicitly and there are no ambient globals.
//!
//! ```rust,ignore
//! use lanonasis_broker::{Broker, BrokerOptions, Operation};
//! use tokio_util::sync::CancellationToken;
//!
//! let broker = Broker::new(BrokerOptions::default())?;
//! broker.sign_in(["memories:read".into()].into(), &CancellationToken::new()).await?;
//! let memories = broker
//!     .dispatch(Operation::ListMemories, serde_json::json!({}), &CancellationToken::new())
//!     .await?;
//! ```

pub mod cli;
pub mod diagnostics;
pub mod discovery;
pub mod logging;
pub mod oauth;
pub mod operations;
pub mod registry;
pub mod rest;
pub mod router;
pub mod token;

use std::collections::BTreeSet;
use std::sync::Arc;

use lanonasis_core::defaults::{self, Timeouts};
use lanonasis_core::domain::{Credential, DiagnosticReport, VendorKey};
use lanonasis_core::error::{BrokerError, BrokerResult};
use lanonasis_storage::{ConfigStore, CredentialStore, FileBackend, StorageBackend};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use crate::diagnostics::{Diagnostics, DiagnosticsOptions};
pub use crate::discovery::{ResolvedEndpoints, ServiceDiscovery};
pub use crate::oauth::{AuthorizeRequest, BrowserOpener, OAuthFlow, SystemBrowser};
pub use crate::operations::Operation;
pub use crate::registry::TransportRegistry;
pub use crate::router::RequestRouter;
pub use crate::token::TokenLifecycle;

/// Construction options for the broker root.
pub struct BrokerOptions {
    /// Storage backend for config and credentials. Defaults to the
    /// platform config directory on disk.
    pub backend: Option<Arc<dyn StorageBackend>>,
    /// OAuth client id registered with the auth gateway.
    pub client_id: String,
    /// Browser seam; tests and headless hosts replace it.
    pub browser: Arc<dyn BrowserOpener>,
    /// Per-operation timeouts.
    pub timeouts: Timeouts,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            backend: None,
            client_id: "lanonasis-broker".to_string(),
            browser: Arc::new(SystemBrowser),
            timeouts: Timeouts::default(),
        }
    }
}

/// The broker root handle. Owns the collaborator graph.
pub struct Broker {
    config: Arc<ConfigStore>,
    credentials: Arc<CredentialStore>,
    discovery: Arc<ServiceDiscovery>,
    tokens: Arc<TokenLifecycle>,
    registry: Arc<TransportRegistry>,
    router: Arc<RequestRouter>,
    diagnostics: Diagnostics,
    oauth: OAuthFlow,
    client_id: String,
}

impl Broker {
    /// Wire the collaborator graph. No I/O happens here.
    pub fn new(options: BrokerOptions) -> BrokerResult<Self> {
        let backend = match options.backend {
            Some(backend) => backend,
            None => Arc::new(FileBackend::at_default_location().ok_or_else(|| {
                BrokerError::StorageUnwritable("no platform config directory".to_string())
            })?),
        };

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| BrokerError::StorageUnwritable(format!("http client: {}", e)))?;

        let config = Arc::new(ConfigStore::new(backend));
        let credentials = Arc::new(CredentialStore::new(config.clone()));
        let discovery = Arc::new(ServiceDiscovery::new(
            config.clone(),
            http.clone(),
            options.timeouts.clone(),
        ));
        let tokens = Arc::new(TokenLifecycle::new(
            credentials.clone(),
            discovery.clone(),
            http.clone(),
            options.client_id.clone(),
        ));
        let registry = Arc::new(TransportRegistry::new(
            http.clone(),
            options.timeouts.clone(),
        ));
        let router = Arc::new(RequestRouter::new(
            config.clone(),
            credentials.clone(),
            tokens.clone(),
            discovery.clone(),
            registry.clone(),
            http.clone(),
            options.timeouts.clone(),
        ));
        let diagnostics = Diagnostics::new(
            config.clone(),
            credentials.clone(),
            discovery.clone(),
            registry.clone(),
            router.clone(),
        );
        let oauth = OAuthFlow::new(http, options.browser, options.timeouts);

        Ok(Self {
            config,
            credentials,
            discovery,
            tokens,
            registry,
            router,
            diagnostics,
            oauth,
            client_id: options.client_id,
        })
    }

    /// Interactive sign-in: run the PKCE flow and persist the token.
    pub async fn sign_in(
        &self,
        scopes: BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> BrokerResult<()> {
        let resolved = self.discovery.resolve(false).await?;
        let config = self.config.load().await?;
        let callback_port = config
            .transport_preferences
            .callback_port
            .unwrap_or(defaults::DEFAULT_OAUTH_CALLBACK_PORT);

        let record = self
            .oauth
            .authorize(
                AuthorizeRequest {
                    endpoints: resolved.endpoints,
                    scopes,
                    client_id: self.client_id.clone(),
                    callback_port,
                },
                cancel,
            )
            .await?;

        self.credentials.set(Credential::oauth(record)).await?;
        info!("[Broker] Signed in");
        Ok(())
    }

    /// Store an API key (hashed before persistence). Accepts vendor keys
    /// of the `pk_*.sk_*` shape too.
    pub async fn sign_in_with_key(&self, key: &str) -> BrokerResult<()> {
        let credential = match VendorKey::parse(key) {
            Some(vendor) => Credential::vendor_key(&vendor),
            None => Credential::api_key(key),
        };
        self.credentials.set(credential).await
    }

    /// Drop the active credential and close all sessions.
    pub async fn sign_out(&self) -> BrokerResult<()> {
        self.router.shutdown().await;
        self.credentials.clear().await
    }

    /// Dispatch one operation through the transport chain.
    pub async fn dispatch(
        &self,
        operation: Operation,
        payload: Value,
        cancel: &CancellationToken,
    ) -> BrokerResult<Value> {
        self.router.dispatch(operation, payload, cancel).await
    }

    /// Resolve (and optionally force-refresh) the endpoint set.
    pub async fn resolve_endpoints(&self, force_refresh: bool) -> BrokerResult<ResolvedEndpoints> {
        self.discovery.resolve(force_refresh).await
    }

    /// Pin one endpoint field; it will shadow discovery until cleared.
    pub async fn pin_endpoint(&self, field: &str, url: String) -> BrokerResult<bool> {
        let now = chrono::Utc::now();
        let field_owned = field.to_string();
        let mut pinned = false;
        self.config
            .update(|config| {
                pinned = config.pin_endpoint(&field_owned, url.clone(), now);
            })
            .await?;
        Ok(pinned)
    }

    /// Clear all manual endpoint overrides, forcing a fresh discovery.
    pub async fn clear_endpoint_overrides(&self) -> BrokerResult<()> {
        self.config
            .update(|config| config.clear_endpoint_overrides())
            .await?;
        Ok(())
    }

    /// Run structured diagnostics.
    pub async fn run_diagnostics(&self, options: DiagnosticsOptions) -> DiagnosticReport {
        self.diagnostics.run(options).await
    }

    /// Currently-valid auth material (refreshing when needed).
    pub async fn acquire_auth(&self) -> BrokerResult<lanonasis_core::domain::AuthMaterial> {
        self.tokens.acquire().await
    }

    /// Collaborator accessors for hosts that need finer control.
    pub fn credential_store(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn transport_registry(&self) -> &Arc<TransportRegistry> {
        &self.registry
    }

    /// Close every live MCP session and release child processes.
    pub async fn shutdown(&self) {
        self.router.shutdown().await;
    }
}
