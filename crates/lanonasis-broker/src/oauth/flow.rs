//! OAuth authorization flow
//!
//! PKCE authorization code dance against the auth gateway:
//! bind the loopback listener, open the browser, await the callback,
//! verify state, redeem the code. The listener is bound before the
//! browser opens; a port conflict aborts the flow without any browser
//! interaction.

use std::collections::BTreeSet;
use std::sync::Arc;

use lanonasis_core::defaults::{self, Timeouts};
use lanonasis_core::domain::token::now_ms;
use lanonasis_core::domain::{EndpointSet, TokenRecord};
use lanonasis_core::error::{BrokerError, BrokerResult};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::listener::CallbackListener;
use super::pkce::{generate_state, is_valid_state, PkcePair, CHALLENGE_METHOD};

/// Browser launch seam; the default implementation opens the system
/// browser, tests intercept.
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> BrokerResult<()>;
}

/// Opens the user's default browser.
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> BrokerResult<()> {
        open::that(url).map_err(|e| BrokerError::AuthorizationDenied {
            error: "browser_unavailable".to_string(),
            description: Some(e.to_string()),
        })
    }
}

/// Inputs for one authorization.
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    pub endpoints: EndpointSet,
    pub scopes: BTreeSet<String>,
    pub client_id: String,
    pub callback_port: u16,
}

/// Body of a successful token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEndpointResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenEndpointResponse {
    /// Convert into a stored record. The server's scope string wins over
    /// the requested set when present.
    pub fn into_record(self, requested_scopes: BTreeSet<String>, now: i64) -> TokenRecord {
        let scope = match &self.scope {
            Some(s) => s.split_whitespace().map(str::to_string).collect(),
            None => requested_scopes,
        };
        TokenRecord::from_response(
            self.access_token,
            self.refresh_token,
            self.expires_in,
            scope,
            now,
        )
    }
}

/// The PKCE authorization flow.
pub struct OAuthFlow {
    http: reqwest::Client,
    browser: Arc<dyn BrowserOpener>,
    timeouts: Timeouts,
}

impl OAuthFlow {
    pub fn new(http: reqwest::Client, browser: Arc<dyn BrowserOpener>, timeouts: Timeouts) -> Self {
        Self {
            http,
            browser,
            timeouts,
        }
    }

    /// Run the full authorization and return the redeemed token record.
    /// The caller persists it.
    pub async fn authorize(
        &self,
        request: AuthorizeRequest,
        cancel: &CancellationToken,
    ) -> BrokerResult<TokenRecord> {
        let pkce = PkcePair::generate();
        let state = generate_state();

        // Bind before the browser opens. A conflict is a hard error and
        // the browser must stay closed.
        let listener = CallbackListener::bind(request.callback_port).await?;
        let redirect_uri = defaults::oauth_redirect_uri(listener.port());

        let authorize_url = build_authorize_url(
            &request.endpoints,
            &request.client_id,
            &redirect_uri,
            &request.scopes,
            &pkce.challenge,
            &state,
        )?;

        debug!("[OAuth] Opening browser for authorization");
        if let Err(e) = self.browser.open(authorize_url.as_str()) {
            // Listener drops here, releasing the port.
            return Err(e);
        }

        let callback = tokio::select! {
            _ = cancel.cancelled() => {
                info!("[OAuth] Authorization cancelled");
                return Err(BrokerError::Cancelled);
            }
            result = listener.wait(self.timeouts.oauth_callback) => result?,
        };

        // State first: a bad or missing state discards the code without
        // redemption.
        match callback.state.as_deref() {
            Some(received) if is_valid_state(received) && received == state => {}
            _ => return Err(BrokerError::StateMismatch),
        }

        if let Some(error) = callback.error {
            return Err(BrokerError::AuthorizationDenied {
                error,
                description: callback.error_description,
            });
        }

        let code = callback.code.ok_or_else(|| BrokerError::AuthorizationDenied {
            error: "invalid_request".to_string(),
            description: Some("callback carried neither code nor error".to_string()),
        })?;

        let record = self
            .exchange_code(
                &request.endpoints,
                &request.client_id,
                &code,
                &redirect_uri,
                &pkce.verifier,
                request.scopes,
            )
            .await?;

        info!("[OAuth] Authorization complete");
        Ok(record)
    }

    /// Redeem the authorization code at the token endpoint.
    ///
    /// PKCE + state are the CSRF defense; no CSRF token is sent. A 4xx
    /// from CSRF middleware is a server misconfiguration and is surfaced
    /// verbatim.
    async fn exchange_code(
        &self,
        endpoints: &EndpointSet,
        client_id: &str,
        code: &str,
        redirect_uri: &str,
        verifier: &str,
        requested_scopes: BTreeSet<String>,
    ) -> BrokerResult<TokenRecord> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", verifier),
            ("client_id", client_id),
        ];

        let response = self
            .http
            .post(endpoints.token_url())
            .form(&params)
            .send()
            .await
            .map_err(|e| BrokerError::TransportUnreachable {
                transport: "auth".to_string(),
                message: format!("token endpoint unreachable: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::AuthorizationDenied {
                error: "token_exchange_failed".to_string(),
                description: Some(format!("HTTP {}: {}", status.as_u16(), body)),
            });
        }

        let body: TokenEndpointResponse =
            response
                .json()
                .await
                .map_err(|e| BrokerError::AuthorizationDenied {
                    error: "token_exchange_failed".to_string(),
                    description: Some(format!("malformed token response: {}", e)),
                })?;

        Ok(body.into_record(requested_scopes, now_ms()))
    }
}

fn build_authorize_url(
    endpoints: &EndpointSet,
    client_id: &str,
    redirect_uri: &str,
    scopes: &BTreeSet<String>,
    challenge: &str,
    state: &str,
) -> BrokerResult<Url> {
    let mut url = Url::parse(&endpoints.authorize_url())
        .map_err(|e| BrokerError::DiscoveryFailed(format!("authBase invalid: {}", e)))?;
    let scope = scopes.iter().cloned().collect::<Vec<_>>().join(" ");
    url.query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("scope", &scope)
        .append_pair("code_challenge", challenge)
        .append_pair("code_challenge_method", CHALLENGE_METHOD)
        .append_pair("state", state);
    Ok(url)
}
