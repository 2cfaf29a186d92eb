//! Service discovery
//!
//! Resolves the endpoint families from the platform's well-known document,
//! caches the result in the config store, and layers manual and
//! environment overrides on top. Discovery failure with no cache falls
//! back to the compiled defaults and reports `fallback` status so
//! diagnostics can surface it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use lanonasis_core::defaults::{self, Timeouts};
use lanonasis_core::domain::{
    DiscoveryDocument, DiscoveryStatus, EndpointOverrides, EndpointSet,
};
use lanonasis_core::error::{BrokerError, BrokerResult};
use lanonasis_storage::ConfigStore;
use tracing::{debug, info, warn};

/// A resolved endpoint set with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoints {
    pub endpoints: EndpointSet,
    pub status: DiscoveryStatus,
}

/// Endpoint resolver with cache, overrides, and fallback.
pub struct ServiceDiscovery {
    config: Arc<ConfigStore>,
    http: reqwest::Client,
    timeouts: Timeouts,
    /// Set when a previously-ready transport hard-fails; forces the next
    /// resolution to refresh.
    stale: AtomicBool,
}

impl ServiceDiscovery {
    pub fn new(config: Arc<ConfigStore>, http: reqwest::Client, timeouts: Timeouts) -> Self {
        Self {
            config,
            http,
            timeouts,
            stale: AtomicBool::new(false),
        }
    }

    /// Mark the cache suspect; the next `resolve` refreshes regardless of
    /// age.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    /// Resolve the endpoint set.
    ///
    /// Overrides (manual config pins, then environment variables) shadow
    /// discovered values and survive refreshes. The returned set always
    /// validates.
    pub async fn resolve(&self, force_refresh: bool) -> BrokerResult<ResolvedEndpoints> {
        let config = self.config.load().await?;
        let overrides = config.manual_endpoint_overrides.clone();
        let env = env_overrides();

        let force = force_refresh || self.stale.swap(false, Ordering::SeqCst);
        let cache_fresh = match (&config.endpoints, config.last_service_discovery) {
            (Some(_), Some(at)) => {
                let age = Utc::now().signed_duration_since(at);
                age.to_std()
                    .map(|age| age < defaults::DISCOVERY_CACHE_TTL)
                    .unwrap_or(true)
            }
            _ => false,
        };

        if !force && cache_fresh {
            let mut endpoints = config.endpoints.clone().unwrap_or_default();
            overrides.apply(&mut endpoints);
            env.apply(&mut endpoints);
            endpoints.validate()?;
            return Ok(ResolvedEndpoints {
                endpoints,
                status: DiscoveryStatus::Cached,
            });
        }

        let root = discovery_root(&overrides, &env);
        match self.fetch_document(&root).await {
            Ok(document) => {
                let discovered = document.into_endpoint_set();
                self.config
                    .update(|config| {
                        config.endpoints = Some(discovered.clone());
                        config.last_service_discovery = Some(Utc::now());
                    })
                    .await?;

                let mut endpoints = discovered;
                overrides.apply(&mut endpoints);
                env.apply(&mut endpoints);
                endpoints.validate()?;
                info!("[Discovery] Endpoints refreshed from {}", root);
                Ok(ResolvedEndpoints {
                    endpoints,
                    status: DiscoveryStatus::Fresh,
                })
            }
            Err(e) => {
                if let Some(cached) = config.endpoints.clone() {
                    warn!("[Discovery] Refresh failed ({}); serving cached endpoints", e);
                    let mut endpoints = cached;
                    overrides.apply(&mut endpoints);
                    env.apply(&mut endpoints);
                    endpoints.validate()?;
                    return Ok(ResolvedEndpoints {
                        endpoints,
                        status: DiscoveryStatus::Cached,
                    });
                }
                warn!(
                    "[Discovery] Discovery failed with no cache ({}); using compiled defaults",
                    e
                );
                let mut endpoints = EndpointSet::compiled_defaults();
                overrides.apply(&mut endpoints);
                env.apply(&mut endpoints);
                endpoints.validate()?;
                Ok(ResolvedEndpoints {
                    endpoints,
                    status: DiscoveryStatus::Fallback,
                })
            }
        }
    }

    async fn fetch_document(&self, root: &str) -> BrokerResult<DiscoveryDocument> {
        let url = format!("{}{}", root.trim_end_matches('/'), defaults::DISCOVERY_PATH);
        debug!("[Discovery] Fetching {}", url);

        let response = self
            .http
            .get(&url)
            .timeout(self.timeouts.discovery)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| BrokerError::DiscoveryFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BrokerError::DiscoveryFailed(format!(
                "HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| BrokerError::DiscoveryFailed(format!("malformed document: {}", e)))
    }
}

/// The root the well-known document is fetched from: pinned memory base,
/// env override, or the compiled default.
fn discovery_root(overrides: &EndpointOverrides, env: &EndpointOverrides) -> String {
    env.memory_base
        .clone()
        .or_else(|| overrides.memory_base.clone())
        .unwrap_or_else(|| defaults::DEFAULT_MEMORY_BASE.to_string())
}

/// Environment overrides, applied last.
fn env_overrides() -> EndpointOverrides {
    let mut overrides = EndpointOverrides::default();
    if let Ok(value) = std::env::var(defaults::ENV_API_URL) {
        if !value.is_empty() {
            overrides.memory_base = Some(value);
        }
    }
    if let Ok(value) = std::env::var(defaults::ENV_AUTH_URL) {
        if !value.is_empty() {
            overrides.auth_base = Some(value);
        }
    }
    if let Ok(value) = std::env::var(defaults::ENV_MCP_URL) {
        if !value.is_empty() {
            overrides.mcp_rest_base = Some(value);
        }
    }
    overrides
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanonasis_storage::MemoryBackend;

    fn store() -> Arc<ConfigStore> {
        Arc::new(ConfigStore::new(Arc::new(MemoryBackend::new())))
    }

    fn discovery(config: Arc<ConfigStore>) -> ServiceDiscovery {
        ServiceDiscovery::new(config, reqwest::Client::new(), Timeouts::default())
    }

    #[tokio::test]
    async fn test_fresh_cache_is_served_without_refresh() {
        let config = store();
        config
            .update(|c| {
                c.endpoints = Some(EndpointSet {
                    auth_base: "https://cached.example".to_string(),
                    ..EndpointSet::compiled_defaults()
                });
                c.last_service_discovery = Some(Utc::now());
            })
            .await
            .unwrap();

        let resolved = discovery(config).resolve(false).await.unwrap();
        assert_eq!(resolved.status, DiscoveryStatus::Cached);
        assert_eq!(resolved.endpoints.auth_base, "https://cached.example");
    }

    #[tokio::test]
    async fn test_manual_override_shadows_cache_and_survives() {
        let config = store();
        config
            .update(|c| {
                c.endpoints = Some(EndpointSet::compiled_defaults());
                c.last_service_discovery = Some(Utc::now());
                c.pin_endpoint("authBase", "https://pinned.example".to_string(), Utc::now());
            })
            .await
            .unwrap();

        let discovery = discovery(config.clone());
        let resolved = discovery.resolve(false).await.unwrap();
        assert_eq!(resolved.endpoints.auth_base, "https://pinned.example");

        // The override remains pinned in config after resolution.
        let persisted = config.load().await.unwrap();
        assert_eq!(
            persisted.manual_endpoint_overrides.auth_base.as_deref(),
            Some("https://pinned.example")
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_with_cache_keeps_cache() {
        let config = store();
        config
            .update(|c| {
                c.endpoints = Some(EndpointSet {
                    memory_base: "http://127.0.0.1:9".to_string(),
                    ..EndpointSet::compiled_defaults()
                });
                c.last_service_discovery = Some(Utc::now());
                // Point discovery at a dead port so the refresh fails fast.
                c.pin_endpoint("memoryBase", "http://127.0.0.1:9".to_string(), Utc::now());
            })
            .await
            .unwrap();

        let resolved = discovery(config).resolve(true).await.unwrap();
        assert_eq!(resolved.status, DiscoveryStatus::Cached);
    }

    #[tokio::test]
    async fn test_failure_with_no_cache_falls_back_to_defaults() {
        let config = store();
        config
            .update(|c| {
                c.pin_endpoint("memoryBase", "http://127.0.0.1:9".to_string(), Utc::now());
            })
            .await
            .unwrap();

        let resolved = discovery(config).resolve(false).await.unwrap();
        assert_eq!(resolved.status, DiscoveryStatus::Fallback);
        // Pinned field still shadows the fallback set.
        assert_eq!(resolved.endpoints.memory_base, "http://127.0.0.1:9");
        assert_eq!(
            resolved.endpoints.auth_base,
            defaults::DEFAULT_AUTH_BASE
        );
    }

    #[tokio::test]
    async fn test_mark_stale_forces_refresh_attempt() {
        let config = store();
        config
            .update(|c| {
                c.endpoints = Some(EndpointSet::compiled_defaults());
                c.last_service_discovery = Some(Utc::now());
                c.pin_endpoint("memoryBase", "http://127.0.0.1:9".to_string(), Utc::now());
            })
            .await
            .unwrap();

        let discovery = discovery(config);
        discovery.mark_stale();
        // Refresh fails against the dead port, so we land on the cache;
        // the point is that the stale flag is consumed.
        let resolved = discovery.resolve(false).await.unwrap();
        assert_eq!(resolved.status, DiscoveryStatus::Cached);
        assert!(!discovery.stale.load(Ordering::SeqCst));
    }
}
