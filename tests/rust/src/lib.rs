//! Shared test utilities and fixtures for the broker integration tests.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use lanonasis_broker::{Broker, BrokerOptions};
use lanonasis_core::defaults::Timeouts;
use lanonasis_core::domain::{Credential, EndpointSet, TokenRecord};
use lanonasis_storage::{ConfigStore, MemoryBackend, StorageBackend};

pub mod mocks;
pub use mocks::{MockMcpServer, McpMode, RedirectingBrowser};

/// A broker over in-memory storage with a pre-seeded endpoint cache, so
/// tests never perform live service discovery.
pub struct BrokerHarness {
    pub broker: Broker,
    pub backend: Arc<dyn StorageBackend>,
}

/// Endpoint set where every family points at `base` except the WS base,
/// which needs its own URL.
pub fn endpoints(base: &str, ws_base: &str) -> EndpointSet {
    EndpointSet {
        auth_base: base.to_string(),
        memory_base: base.to_string(),
        mcp_rest_base: base.to_string(),
        mcp_ws_base: ws_base.to_string(),
        mcp_sse_base: format!("{}/sse", base),
        project_scope: "default".to_string(),
    }
}

impl BrokerHarness {
    pub async fn new(
        endpoints: EndpointSet,
        browser: Arc<dyn lanonasis_broker::BrowserOpener>,
        mutate: impl FnOnce(&mut lanonasis_core::domain::BrokerConfig),
    ) -> Self {
        let backend: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let config = ConfigStore::new(backend.clone());
        config
            .update(|c| {
                c.endpoints = Some(endpoints);
                c.last_service_discovery = Some(Utc::now());
                mutate(c);
            })
            .await
            .unwrap();

        let broker = Broker::new(BrokerOptions {
            backend: Some(backend.clone()),
            client_id: "test-client".to_string(),
            browser,
            timeouts: Timeouts::default(),
        })
        .unwrap();

        Self { broker, backend }
    }

    /// Store an expired OAuth credential with the given refresh token.
    pub async fn seed_expired_oauth(&self, refresh_token: &str) {
        self.broker
            .credential_store()
            .set(Credential::oauth(TokenRecord {
                access_token: "AT1".to_string(),
                expires_at: lanonasis_core::domain::now_ms() - 1000,
                refresh_token: Some(refresh_token.to_string()),
                scope: BTreeSet::new(),
            }))
            .await
            .unwrap();
    }

    /// Store a long-lived OAuth credential.
    pub async fn seed_valid_oauth(&self, access_token: &str, refresh_token: Option<&str>) {
        self.broker
            .credential_store()
            .set(Credential::oauth(TokenRecord {
                access_token: access_token.to_string(),
                expires_at: lanonasis_core::domain::now_ms() + 3_600_000,
                refresh_token: refresh_token.map(str::to_string),
                scope: BTreeSet::new(),
            }))
            .await
            .unwrap();
    }
}

/// Scope set fixture.
pub fn scopes(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|s| s.to_string()).collect()
}
