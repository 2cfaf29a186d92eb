//! Request router
//!
//! Per-operation transport selection with a fallback chain. For each
//! ranked candidate the router acquires auth material, dispatches via the
//! MCP client, direct REST, or the CLI wrapper, and classifies the
//! outcome: transient failures escalate to the next candidate, auth
//! failures retry the same candidate once after invalidating the token
//! (the credential problem is global, so a second auth failure surfaces
//! `ReauthenticationRequired` instead of trying other transports), and
//! terminal rejections surface immediately. Mutations never cross
//! transports on a non-auth error because partial success is unknowable.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lanonasis_core::defaults::{self, Timeouts};
use lanonasis_core::domain::{AuthMaterial, EndpointSet, TransportDescriptor, TransportKind};
use lanonasis_core::error::{BrokerError, BrokerResult, CandidateOutcome};
use lanonasis_mcp::client::{McpClient, McpClientConfig};
use lanonasis_mcp::transport::ws::reconnect_delay;
use lanonasis_mcp::transport::{HttpTransport, StdioTransport, TransportHandle, WsTransport};
use lanonasis_storage::{ConfigStore, CredentialStore};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::CliDispatcher;
use crate::discovery::ServiceDiscovery;
use crate::operations::Operation;
use crate::registry::{TransportRegistry, REST_DESCRIPTOR_ID};
use crate::rest::RestDispatcher;
use crate::token::TokenLifecycle;

/// Upper bound on a single rate-limit wait.
const RATE_LIMIT_DELAY_CAP: Duration = Duration::from_secs(10);

/// Rate-limit retries per candidate.
const RATE_LIMIT_BUDGET: u32 = 3;

enum Classified {
    /// 401 shaped: token may have expired under us.
    AuthExpired,
    /// Transient transport failure; try the next candidate.
    Transient,
    /// Terminal; surface without trying other transports.
    Terminal,
    /// Throttled; retry the same candidate within budget.
    RateLimited(Option<Duration>),
}

fn classify(error: &BrokerError) -> Classified {
    match error {
        BrokerError::TransportAuthRejected { message, .. } => {
            if message.contains("401") || message.to_ascii_lowercase().contains("unauthorized") {
                Classified::AuthExpired
            } else {
                // 403-shaped handshake rejections are terminal.
                Classified::Terminal
            }
        }
        BrokerError::RateLimited { retry_after } => Classified::RateLimited(*retry_after),
        BrokerError::OperationRejected { .. } => Classified::Terminal,
        BrokerError::TransportUnreachable { .. } => Classified::Transient,
        BrokerError::TransportProtocolViolation { message, .. } => {
            // A JSON-RPC application error is a server verdict on the
            // request; a broken frame is transport trouble.
            if message.contains("JSON-RPC error") {
                Classified::Terminal
            } else {
                Classified::Transient
            }
        }
        _ => Classified::Terminal,
    }
}

/// The per-operation dispatcher.
pub struct RequestRouter {
    config: Arc<ConfigStore>,
    credentials: Arc<CredentialStore>,
    tokens: Arc<TokenLifecycle>,
    discovery: Arc<ServiceDiscovery>,
    registry: Arc<TransportRegistry>,
    rest: RestDispatcher,
    cli: CliDispatcher,
    sessions: DashMap<String, Arc<McpClient>>,
    ws_backoff: DashMap<String, (u32, Instant)>,
    timeouts: Timeouts,
}

impl RequestRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConfigStore>,
        credentials: Arc<CredentialStore>,
        tokens: Arc<TokenLifecycle>,
        discovery: Arc<ServiceDiscovery>,
        registry: Arc<TransportRegistry>,
        http: reqwest::Client,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            config,
            credentials,
            tokens,
            discovery,
            registry,
            rest: RestDispatcher::new(http, timeouts.clone()),
            cli: CliDispatcher::new(timeouts.clone()),
            sessions: DashMap::new(),
            ws_backoff: DashMap::new(),
            timeouts,
        }
    }

    /// Dispatch one operation through the ranked candidate chain.
    pub async fn dispatch(
        &self,
        operation: Operation,
        payload: Value,
        cancel: &CancellationToken,
    ) -> BrokerResult<Value> {
        let resolved = self.discovery.resolve(false).await?;
        let config = self.config.load().await?;
        self.registry
            .sync(&resolved.endpoints, &config.transport_preferences);

        let authenticated = self.credentials.get().await?.is_some();
        let candidates = self.registry.candidates(
            operation,
            authenticated,
            config.transport_preferences.ranking,
        );
        let generation = self.registry.generation();

        debug!(
            operation = %operation,
            candidates = ?candidates.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            "[Router] Dispatching"
        );

        let mut attempts: Vec<CandidateOutcome> = Vec::new();
        for candidate in candidates {
            if cancel.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }

            let mut auth = self.tokens.acquire().await?;
            let mut auth_retried = false;
            let mut rate_retries = 0u32;

            loop {
                let started = Instant::now();
                // Dropping the in-flight future on cancellation aborts the
                // underlying HTTP request or MCP call.
                let result = tokio::select! {
                    _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                    result = self.dispatch_via(
                        &candidate, operation, &payload, &auth, &resolved.endpoints
                    ) => result,
                };
                let latency_ms = started.elapsed().as_millis() as u64;

                let error = match result {
                    Ok(value) => {
                        self.registry
                            .report_outcome(&candidate.id, true, latency_ms, generation);
                        return Ok(value);
                    }
                    Err(error) => error,
                };

                match classify(&error) {
                    Classified::AuthExpired => {
                        if auth_retried {
                            info!(
                                transport = %candidate.id,
                                "[Router] Second auth rejection; credential problem is global"
                            );
                            return Err(BrokerError::ReauthenticationRequired);
                        }
                        auth_retried = true;
                        debug!(transport = %candidate.id, "[Router] 401; invalidating token and retrying once");
                        self.tokens.invalidate().await?;
                        self.drop_session(&candidate.id).await;
                        auth = self.tokens.acquire().await?;
                    }
                    Classified::RateLimited(retry_after) => {
                        if rate_retries >= RATE_LIMIT_BUDGET {
                            return Err(error);
                        }
                        rate_retries += 1;
                        let delay = retry_after
                            .unwrap_or(Duration::from_secs(1))
                            .min(RATE_LIMIT_DELAY_CAP);
                        debug!(transport = %candidate.id, ?delay, "[Router] Rate limited; honouring Retry-After");
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Classified::Terminal => return Err(error),
                    Classified::Transient => {
                        let demoted = self.registry.report_outcome(
                            &candidate.id,
                            false,
                            latency_ms,
                            generation,
                        );
                        if demoted {
                            // A previously-ready transport hard-failed;
                            // endpoints may have moved.
                            self.discovery.mark_stale();
                        }
                        self.drop_session(&candidate.id).await;
                        attempts.push(CandidateOutcome {
                            transport_id: candidate.id.clone(),
                            summary: error.to_string(),
                        });
                        if !operation.is_idempotent() {
                            warn!(
                                operation = %operation,
                                "[Router] Mutation failed in flight; not retrying across transports"
                            );
                            return Err(error);
                        }
                        break;
                    }
                }
            }
        }

        Err(BrokerError::NoTransportAvailable { attempts })
    }

    /// Close and forget any session bound to a transport id.
    pub async fn drop_session(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            let _ = session.close().await;
        }
    }

    /// Close every MCP session (shutdown or sign-out).
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.drop_session(&id).await;
        }
    }

    /// Session info for diagnostics: (transport id, server name) pairs.
    pub async fn active_sessions(&self) -> Vec<(String, Option<String>)> {
        let mut out = Vec::new();
        for entry in self.sessions.iter() {
            if entry.value().is_invalidated() {
                continue;
            }
            let info = entry.value().server_info().await.map(|i| i.name);
            out.push((entry.key().clone(), info));
        }
        out
    }

    /// A live session's tool catalog, if any session is up.
    pub async fn any_session_tools(&self) -> Option<Vec<String>> {
        for entry in self.sessions.iter() {
            let session = entry.value().clone();
            if session.is_invalidated() {
                continue;
            }
            if let Ok(tools) = session.tools().await {
                return Some(tools.into_iter().map(|t| t.name).collect());
            }
        }
        None
    }

    async fn dispatch_via(
        &self,
        candidate: &TransportDescriptor,
        operation: Operation,
        payload: &Value,
        auth: &AuthMaterial,
        endpoints: &EndpointSet,
    ) -> BrokerResult<Value> {
        if candidate.id == REST_DESCRIPTOR_ID {
            return self.rest.dispatch(operation, payload, endpoints, auth).await;
        }
        if candidate.kind == TransportKind::Cli {
            let command = candidate.command.as_deref().ok_or_else(|| {
                BrokerError::TransportUnreachable {
                    transport: "cli".to_string(),
                    message: "no CLI command configured".to_string(),
                }
            })?;
            return self.cli.dispatch(command, operation, payload, auth).await;
        }

        let session = self.session_for(candidate, auth, endpoints).await?;
        match operation.tool_name() {
            Some(tool) => session.call_tool(tool, payload.clone()).await,
            None => {
                let tools = session.tools().await?;
                serde_json::to_value(tools).map_err(|e| BrokerError::TransportProtocolViolation {
                    transport: candidate.kind.to_string(),
                    message: format!("tool catalog serialization failed: {}", e),
                })
            }
        }
    }

    /// Get or negotiate the MCP session for a candidate.
    async fn session_for(
        &self,
        candidate: &TransportDescriptor,
        auth: &AuthMaterial,
        endpoints: &EndpointSet,
    ) -> BrokerResult<Arc<McpClient>> {
        if let Some(existing) = self.sessions.get(&candidate.id) {
            if !existing.is_invalidated() {
                return Ok(existing.clone());
            }
        }
        // Invalidated sessions are replaced, never reused.
        self.drop_session(&candidate.id).await;

        let transport = self.build_transport(candidate, auth, endpoints).await?;
        let client = McpClient::connect(
            transport,
            McpClientConfig {
                request_timeout: self.timeouts.tool_call,
                keep_alive: candidate.kind == TransportKind::Ws,
                ..Default::default()
            },
        )
        .await?;
        self.sessions.insert(candidate.id.clone(), client.clone());
        Ok(client)
    }

    async fn build_transport(
        &self,
        candidate: &TransportDescriptor,
        auth: &AuthMaterial,
        endpoints: &EndpointSet,
    ) -> BrokerResult<TransportHandle> {
        let (header, value) = auth.header();
        let header_map: HashMap<String, String> =
            [(header.to_string(), value.clone())].into_iter().collect();

        match candidate.kind {
            TransportKind::Ws => {
                // Exponential reconnect backoff: a recently-failed socket
                // is not retried until its delay elapses.
                if let Some(entry) = self.ws_backoff.get(&candidate.id) {
                    let (attempts, last_attempt) = *entry.value();
                    let delay = reconnect_delay(attempts.saturating_sub(1));
                    if last_attempt.elapsed() < delay {
                        return Err(BrokerError::TransportUnreachable {
                            transport: "ws".to_string(),
                            message: format!("in reconnect backoff ({:?})", delay),
                        });
                    }
                }
                let headers = vec![(header.to_string(), value)];
                match WsTransport::connect(
                    &endpoints.mcp_ws_base,
                    &headers,
                    self.timeouts.ws_handshake,
                )
                .await
                {
                    Ok(transport) => {
                        self.ws_backoff.remove(&candidate.id);
                        Ok(Arc::new(transport))
                    }
                    Err(e) => {
                        let attempts = self
                            .ws_backoff
                            .get(&candidate.id)
                            .map(|entry| entry.value().0)
                            .unwrap_or(0)
                            + 1;
                        self.ws_backoff
                            .insert(candidate.id.clone(), (attempts, Instant::now()));
                        Err(e)
                    }
                }
            }
            TransportKind::Http => {
                let endpoint = crate::registry::mcp_http_endpoint(endpoints);
                let transport =
                    HttpTransport::new(endpoint, header_map, self.timeouts.tool_call)?;
                Ok(Arc::new(transport))
            }
            TransportKind::Sse => {
                let endpoint = crate::registry::mcp_http_endpoint(endpoints);
                let transport = HttpTransport::new_sse(
                    endpoint,
                    endpoints.mcp_sse_base.clone(),
                    header_map,
                    self.timeouts.tool_call,
                )?;
                transport.open_notification_stream().await?;
                Ok(Arc::new(transport))
            }
            TransportKind::Stdio => {
                let command = candidate.command.as_deref().ok_or_else(|| {
                    BrokerError::TransportUnreachable {
                        transport: "stdio".to_string(),
                        message: "no stdio command configured".to_string(),
                    }
                })?;
                let mut env = HashMap::new();
                env.insert(
                    defaults::ENV_API_KEY.to_string(),
                    auth.env_value().to_string(),
                );
                let transport = StdioTransport::spawn(command, &env).await?;
                Ok(Arc::new(transport))
            }
            TransportKind::Cli => Err(BrokerError::TransportProtocolViolation {
                transport: "cli".to_string(),
                message: "CLI dispatch does not use MCP sessions".to_string(),
            }),
        }
    }
}
