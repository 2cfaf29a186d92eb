//! Token lifecycle
//!
//! Centralizes the "token or API key" resolution: every caller receives
//! ready-to-present auth material, and transport adapters only choose
//! where it goes. Refreshes are single-flight keyed on the refresh-token
//! value; concurrent callers awaiting an expired token share one HTTP
//! request, and cancelling an awaiter never cancels the in-flight refresh.

use std::sync::Arc;

use lanonasis_core::domain::token::now_ms;
use lanonasis_core::domain::{AuthMaterial, Credential, TokenRecord};
use lanonasis_core::error::{BrokerError, BrokerResult};
use lanonasis_storage::CredentialStore;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::discovery::ServiceDiscovery;
use crate::oauth::TokenEndpointResponse;

/// Backoff schedule for transient refresh failures: one initial attempt
/// plus one retry per entry.
const REFRESH_BACKOFF_MS: [u64; 3] = [250, 500, 1000];

/// Shareable refresh failure; converted to `BrokerError` per caller.
#[derive(Debug, Clone)]
enum RefreshFailure {
    Reauthentication,
    Transient(String),
}

type RefreshOutcome = Result<TokenRecord, RefreshFailure>;

struct Inflight {
    key: String,
    rx: watch::Receiver<Option<RefreshOutcome>>,
}

/// Token validity and refresh management.
pub struct TokenLifecycle {
    store: Arc<CredentialStore>,
    discovery: Arc<ServiceDiscovery>,
    http: reqwest::Client,
    client_id: String,
    inflight: Arc<Mutex<Option<Inflight>>>,
}

impl TokenLifecycle {
    pub fn new(
        store: Arc<CredentialStore>,
        discovery: Arc<ServiceDiscovery>,
        http: reqwest::Client,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            discovery,
            http,
            client_id: client_id.into(),
            inflight: Arc::new(Mutex::new(None)),
        }
    }

    /// Resolve currently-valid auth material, refreshing an expired OAuth
    /// token when a refresh token is available.
    pub async fn acquire(&self) -> BrokerResult<AuthMaterial> {
        let credential = self
            .store
            .get()
            .await?
            .ok_or(BrokerError::ReauthenticationRequired)?;

        match credential {
            Credential::ApiKey { hash } => Ok(AuthMaterial::ApiKeyHash(hash)),
            Credential::VendorKey { secret_hash, .. } => Ok(AuthMaterial::ApiKeyHash(secret_hash)),
            Credential::Oauth { .. } => {
                let Some(token) = credential.token() else {
                    return Err(BrokerError::ReauthenticationRequired);
                };
                if token.is_valid() {
                    return Ok(AuthMaterial::Bearer(token.access_token));
                }
                debug!("[Token] Access token expired; refreshing");
                let refreshed = self.refresh(token).await?;
                Ok(AuthMaterial::Bearer(refreshed.access_token))
            }
        }
    }

    /// Mark the current token forcibly expired. The next `acquire` must
    /// refresh or fail with `ReauthenticationRequired`.
    pub async fn invalidate(&self) -> BrokerResult<()> {
        if let Some(credential) = self.store.get().await? {
            if let Some(mut token) = credential.token() {
                info!("[Token] Invalidating current access token");
                token.expires_at = 0;
                self.store.set(Credential::oauth(token)).await?;
            }
        }
        Ok(())
    }

    /// Single-flight refresh. The first caller for a given refresh token
    /// spawns the HTTP work on a detached task; everyone (including the
    /// first caller) awaits the shared outcome.
    async fn refresh(&self, current: TokenRecord) -> BrokerResult<TokenRecord> {
        let refresh_token = match current.refresh_token.clone() {
            Some(token) => token,
            None => {
                warn!("[Token] Expired token has no refresh token; purging");
                self.store.clear().await?;
                return Err(BrokerError::ReauthenticationRequired);
            }
        };

        let mut rx = {
            let mut guard = self.inflight.lock().await;
            match guard.as_ref() {
                Some(inflight) if inflight.key == refresh_token => inflight.rx.clone(),
                _ => {
                    let (tx, rx) = watch::channel(None);
                    *guard = Some(Inflight {
                        key: refresh_token.clone(),
                        rx: rx.clone(),
                    });
                    self.spawn_refresh(current, refresh_token, tx);
                    rx
                }
            }
        };

        loop {
            let outcome = rx.borrow().clone();
            if let Some(outcome) = outcome {
                return match outcome {
                    Ok(record) => Ok(record),
                    Err(RefreshFailure::Reauthentication) => {
                        Err(BrokerError::ReauthenticationRequired)
                    }
                    Err(RefreshFailure::Transient(message)) => {
                        Err(BrokerError::TokenRefreshTransient(message))
                    }
                };
            }
            if rx.changed().await.is_err() {
                return Err(BrokerError::TokenRefreshTransient(
                    "refresh task dropped".to_string(),
                ));
            }
        }
    }

    fn spawn_refresh(
        &self,
        current: TokenRecord,
        refresh_token: String,
        tx: watch::Sender<Option<RefreshOutcome>>,
    ) {
        let store = self.store.clone();
        let discovery = self.discovery.clone();
        let http = self.http.clone();
        let client_id = self.client_id.clone();
        let inflight = self.inflight.clone();
        let key = refresh_token.clone();

        tokio::spawn(async move {
            let outcome = Self::do_refresh(
                &http,
                &discovery,
                &client_id,
                &refresh_token,
                &current,
            )
            .await;

            match &outcome {
                Ok(record) => {
                    if let Err(e) = store.set(Credential::oauth(record.clone())).await {
                        warn!("[Token] Refreshed token could not be persisted: {}", e);
                    }
                }
                Err(RefreshFailure::Reauthentication) => {
                    info!("[Token] Refresh token rejected; purging credential");
                    if let Err(e) = store.clear().await {
                        warn!("[Token] Purge failed: {}", e);
                    }
                }
                Err(RefreshFailure::Transient(message)) => {
                    warn!("[Token] Refresh failed transiently: {}", message);
                }
            }

            let _ = tx.send(Some(outcome));

            let mut guard = inflight.lock().await;
            if matches!(guard.as_ref(), Some(inflight) if inflight.key == key) {
                *guard = None;
            }
        });
    }

    async fn do_refresh(
        http: &reqwest::Client,
        discovery: &ServiceDiscovery,
        client_id: &str,
        refresh_token: &str,
        current: &TokenRecord,
    ) -> RefreshOutcome {
        let endpoints = discovery
            .resolve(false)
            .await
            .map_err(|e| RefreshFailure::Transient(e.to_string()))?
            .endpoints;
        let token_url = endpoints.token_url();

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client_id),
        ];

        let mut last_error = String::new();
        for attempt in 0..=REFRESH_BACKOFF_MS.len() {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(
                    REFRESH_BACKOFF_MS[attempt - 1],
                ))
                .await;
            }

            match http.post(&token_url).form(&params).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body: TokenEndpointResponse = match response.json().await {
                            Ok(body) => body,
                            Err(e) => {
                                return Err(RefreshFailure::Transient(format!(
                                    "malformed refresh response: {}",
                                    e
                                )))
                            }
                        };
                        let mut record =
                            body.into_record(current.scope.clone(), now_ms());
                        // Rotate the refresh token only when the server
                        // issued a new one.
                        if record.refresh_token.is_none() {
                            record.refresh_token = Some(refresh_token.to_string());
                        }
                        // Expiry is monotonic along a refresh chain.
                        if record.expires_at < current.expires_at {
                            return Err(RefreshFailure::Transient(format!(
                                "server returned earlier expiry ({} < {})",
                                record.expires_at, current.expires_at
                            )));
                        }
                        return Ok(record);
                    }
                    if status.as_u16() == 400 || status.as_u16() == 401 {
                        return Err(RefreshFailure::Reauthentication);
                    }
                    last_error = format!("HTTP {}", status);
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
        }
        Err(RefreshFailure::Transient(last_error))
    }
}
