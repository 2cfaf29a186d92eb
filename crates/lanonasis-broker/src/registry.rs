//! Transport registry
//!
//! Owns the observable transport health state. Descriptors are rebuilt
//! when the endpoint set or preferences change (health carries over by
//! id); probes and router outcome reports fold into the same state
//! machine. A generation counter discards outcome reports from superseded
//! descriptor sets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use lanonasis_core::defaults::Timeouts;
use lanonasis_core::domain::{
    EndpointSet, RankingPreference, TransportDescriptor, TransportKind, TransportPreferences,
    TransportState,
};
use lanonasis_core::error::{BrokerError, BrokerResult};
use lanonasis_mcp::protocol::{initialize_params, methods, JsonRpcRequest};
use lanonasis_mcp::transport::{McpTransport, StdioTransport, WsTransport};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

/// Descriptor id of the direct-REST route (kind `http`, but dispatched
/// without MCP).
pub const REST_DESCRIPTOR_ID: &str = "rest";

/// The registry of candidate transports.
pub struct TransportRegistry {
    descriptors: RwLock<Vec<TransportDescriptor>>,
    /// Fingerprint of the inputs the current descriptor set was built
    /// from; a change triggers a rebuild.
    fingerprint: RwLock<Option<String>>,
    generation: AtomicU64,
    http: reqwest::Client,
    timeouts: Timeouts,
}

impl TransportRegistry {
    pub fn new(http: reqwest::Client, timeouts: Timeouts) -> Self {
        Self {
            descriptors: RwLock::new(Vec::new()),
            fingerprint: RwLock::new(None),
            generation: AtomicU64::new(0),
            http,
            timeouts,
        }
    }

    /// Current descriptor-set generation; outcome reports carry it back.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Rebuild descriptors when endpoints or preferences changed. Health
    /// state survives for descriptors with the same id.
    pub fn sync(&self, endpoints: &EndpointSet, prefs: &TransportPreferences) {
        let fingerprint = format!(
            "{}|{}|{}|{}|{:?}|{:?}",
            endpoints.mcp_ws_base,
            endpoints.mcp_sse_base,
            endpoints.mcp_rest_base,
            endpoints.memory_base,
            prefs.stdio_command,
            prefs.cli_command,
        );
        {
            let current = self.fingerprint.read();
            if current.as_deref() == Some(fingerprint.as_str()) {
                return;
            }
        }

        let previous: HashMap<String, TransportDescriptor> = self
            .descriptors
            .read()
            .iter()
            .map(|d| (d.id.clone(), d.clone()))
            .collect();

        let mut descriptors = Vec::new();
        descriptors.push(
            TransportDescriptor::new("ws", TransportKind::Ws, 10)
                .with_url(endpoints.mcp_ws_base.clone()),
        );
        descriptors.push(
            TransportDescriptor::new("sse", TransportKind::Sse, 20)
                .with_url(endpoints.mcp_sse_base.clone()),
        );
        descriptors.push(
            TransportDescriptor::new("http", TransportKind::Http, 30)
                .with_url(mcp_http_endpoint(endpoints)),
        );
        descriptors.push(
            TransportDescriptor::new(REST_DESCRIPTOR_ID, TransportKind::Http, 40)
                .with_url(endpoints.memory_base.clone()),
        );
        if let Some(command) = &prefs.stdio_command {
            descriptors.push(
                TransportDescriptor::new("stdio", TransportKind::Stdio, 50)
                    .with_command(command.clone()),
            );
        }
        if let Some(command) = &prefs.cli_command {
            // Only register the CLI when the binary is actually on PATH.
            if which::which(command).is_ok() {
                descriptors.push(
                    TransportDescriptor::new("cli", TransportKind::Cli, 60)
                        .with_command(command.clone()),
                );
            } else {
                debug!("[Registry] CLI wrapper {} not found on PATH", command);
            }
        }

        for descriptor in &mut descriptors {
            if let Some(prior) = previous.get(&descriptor.id) {
                descriptor.state = prior.state;
                descriptor.last_health = prior.last_health.clone();
                descriptor.consecutive_failures = prior.consecutive_failures;
            }
        }

        info!(
            count = descriptors.len(),
            "[Registry] Transport descriptors rebuilt"
        );
        *self.descriptors.write() = descriptors;
        *self.fingerprint.write() = Some(fingerprint);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Snapshot of all descriptors (diagnostics).
    pub fn descriptors(&self) -> Vec<TransportDescriptor> {
        self.descriptors.read().clone()
    }

    /// Ranked candidate list for one operation.
    ///
    /// Ranking: the preferred kind first; within a kind `ready` before
    /// `degraded` before `failed`, latency ascending; cross-kind order for
    /// `auto` depends on whether the user is authenticated. Transports
    /// missing a capability the operation needs are omitted, and the
    /// remote MCP push transports are omitted entirely when
    /// unauthenticated.
    pub fn candidates(
        &self,
        operation: crate::operations::Operation,
        authenticated: bool,
        ranking: RankingPreference,
    ) -> Vec<TransportDescriptor> {
        let mut list: Vec<TransportDescriptor> = self
            .descriptors
            .read()
            .iter()
            .filter(|d| supports_operation(d, operation))
            .filter(|d| authenticated || !matches!(d.kind, TransportKind::Ws | TransportKind::Sse))
            .cloned()
            .collect();

        list.sort_by_key(|d| {
            (
                kind_rank(d, ranking, authenticated),
                state_rank(d.state),
                d.last_latency_ms(),
                d.priority,
            )
        });
        list
    }

    /// Fold a dispatch outcome into the health machine. Dispatch failures
    /// are hard failures and demote a ready transport immediately; probe
    /// failures go through the two-strike rule instead. Reports from an
    /// outdated generation (superseded by a rebuild) are discarded.
    /// Returns true when this report demoted a previously-ready transport.
    pub fn report_outcome(&self, id: &str, ok: bool, latency_ms: u64, generation: u64) -> bool {
        if generation != self.generation() {
            debug!(id, "[Registry] Discarding outcome for stale generation");
            return false;
        }
        let mut descriptors = self.descriptors.write();
        let Some(descriptor) = descriptors.iter_mut().find(|d| d.id == id) else {
            return false;
        };
        let was_ready = descriptor.state == TransportState::Ready;
        if ok {
            descriptor.record_outcome(true, latency_ms, Utc::now());
        } else {
            descriptor.record_hard_failure(latency_ms, Utc::now());
        }
        let demoted = was_ready && descriptor.state != TransportState::Ready;
        if demoted {
            warn!(id, "[Registry] Transport left ready state");
        }
        demoted
    }

    /// Probe one transport's liveness and fold the result in.
    pub async fn probe(&self, id: &str) -> BrokerResult<bool> {
        let descriptor = self
            .descriptors
            .read()
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| BrokerError::TransportUnreachable {
                transport: id.to_string(),
                message: "unknown transport id".to_string(),
            })?;

        let started = Instant::now();
        let result = self.run_probe(&descriptor).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let ok = result.is_ok();

        {
            let mut descriptors = self.descriptors.write();
            if let Some(descriptor) = descriptors.iter_mut().find(|d| d.id == id) {
                descriptor.record_outcome(ok, latency_ms, Utc::now());
            }
        }
        if let Err(e) = &result {
            debug!(id, error = %e, "[Registry] Probe failed");
        }
        Ok(ok)
    }

    async fn run_probe(&self, descriptor: &TransportDescriptor) -> BrokerResult<()> {
        let timeout = self.timeouts.health_probe;
        match descriptor.kind {
            TransportKind::Http => {
                let base = descriptor.url.clone().unwrap_or_default();
                let url = format!("{}/health", base.trim_end_matches('/'));
                self.probe_http(reqwest::Method::GET, &url, timeout).await
            }
            TransportKind::Sse => {
                // HEAD of /health at the same origin as the SSE endpoint.
                let base = descriptor.url.clone().unwrap_or_default();
                let url = format!("{}/health", origin_of(&base));
                self.probe_http(reqwest::Method::HEAD, &url, timeout).await
            }
            TransportKind::Ws => {
                let url = descriptor.url.clone().unwrap_or_default();
                let transport = tokio::time::timeout(
                    timeout,
                    WsTransport::connect(&url, &[], self.timeouts.ws_handshake),
                )
                .await
                .map_err(|_| BrokerError::TransportUnreachable {
                    transport: "ws".to_string(),
                    message: "probe timed out".to_string(),
                })??;
                transport.close().await
            }
            TransportKind::Stdio => {
                let command = descriptor.command.clone().unwrap_or_default();
                let probe = async {
                    let transport = StdioTransport::spawn(&command, &HashMap::new()).await?;
                    let frame = JsonRpcRequest::new(
                        1,
                        methods::INITIALIZE,
                        Some(initialize_params("lanonasis-broker-probe", "probe")),
                    );
                    transport
                        .send(serde_json::to_string(&frame).unwrap_or_default())
                        .await?;
                    let response = transport.recv().await;
                    transport.close().await?;
                    match response {
                        Some(_) => Ok(()),
                        None => Err(BrokerError::TransportUnreachable {
                            transport: "stdio".to_string(),
                            message: "server exited before responding".to_string(),
                        }),
                    }
                };
                tokio::time::timeout(timeout, probe).await.map_err(|_| {
                    BrokerError::TransportUnreachable {
                        transport: "stdio".to_string(),
                        message: "probe timed out".to_string(),
                    }
                })?
            }
            TransportKind::Cli => {
                let command = descriptor.command.clone().unwrap_or_default();
                let run = tokio::process::Command::new(&command)
                    .arg("--version")
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::null())
                    .status();
                let status = tokio::time::timeout(timeout, run)
                    .await
                    .map_err(|_| BrokerError::TransportUnreachable {
                        transport: "cli".to_string(),
                        message: "probe timed out".to_string(),
                    })?
                    .map_err(|e| BrokerError::TransportUnreachable {
                        transport: "cli".to_string(),
                        message: format!("spawn failed: {}", e),
                    })?;
                if status.success() {
                    Ok(())
                } else {
                    Err(BrokerError::TransportUnreachable {
                        transport: "cli".to_string(),
                        message: format!("--version exited with {}", status),
                    })
                }
            }
        }
    }

    async fn probe_http(
        &self,
        method: reqwest::Method,
        url: &str,
        timeout: std::time::Duration,
    ) -> BrokerResult<()> {
        let response = self
            .http
            .request(method, url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BrokerError::TransportUnreachable {
                transport: "http".to_string(),
                message: e.to_string(),
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(BrokerError::TransportUnreachable {
                transport: "http".to_string(),
                message: format!("health returned HTTP {}", response.status()),
            })
        }
    }
}

/// MCP-over-HTTP endpoint derived from the REST base.
pub(crate) fn mcp_http_endpoint(endpoints: &EndpointSet) -> String {
    format!("{}/mcp", endpoints.mcp_rest_base.trim_end_matches('/'))
}

/// scheme://host[:port] of a URL, for same-origin probe targets.
fn origin_of(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => {
            let mut origin = format!(
                "{}://{}",
                parsed.scheme(),
                parsed.host_str().unwrap_or_default()
            );
            if let Some(port) = parsed.port() {
                origin.push_str(&format!(":{}", port));
            }
            origin
        }
        Err(_) => url.trim_end_matches('/').to_string(),
    }
}

fn supports_operation(
    descriptor: &TransportDescriptor,
    operation: crate::operations::Operation,
) -> bool {
    use crate::operations::Operation;
    match operation {
        // Tool discovery is an MCP-protocol operation; the CLI wrapper and
        // the direct REST route cannot answer it.
        Operation::ListTools => {
            descriptor.kind != TransportKind::Cli && descriptor.id != REST_DESCRIPTOR_ID
        }
        _ => true,
    }
}

fn state_rank(state: TransportState) -> u8 {
    match state {
        TransportState::Ready => 0,
        TransportState::Unknown | TransportState::Probing => 1,
        TransportState::Degraded => 2,
        TransportState::Failed => 3,
    }
}

/// Cross-kind ordering. The explicit preference pins its kind first; the
/// rest follow the `auto` order, which depends on authentication.
fn kind_rank(
    descriptor: &TransportDescriptor,
    ranking: RankingPreference,
    authenticated: bool,
) -> u8 {
    let preferred = match ranking {
        RankingPreference::CliFirst => descriptor.kind == TransportKind::Cli,
        RankingPreference::WsFirst => descriptor.kind == TransportKind::Ws,
        RankingPreference::RestFirst => descriptor.id == REST_DESCRIPTOR_ID,
        RankingPreference::Auto => false,
    };
    if preferred {
        return 0;
    }
    let base = if authenticated {
        match descriptor.kind {
            TransportKind::Ws => 1,
            TransportKind::Sse => 2,
            TransportKind::Http => {
                if descriptor.id == REST_DESCRIPTOR_ID {
                    4
                } else {
                    3
                }
            }
            TransportKind::Stdio => 5,
            TransportKind::Cli => 6,
        }
    } else {
        match descriptor.kind {
            TransportKind::Stdio => 1,
            TransportKind::Cli => 2,
            TransportKind::Http => {
                if descriptor.id == REST_DESCRIPTOR_ID {
                    4
                } else {
                    3
                }
            }
            TransportKind::Ws | TransportKind::Sse => 7,
        }
    };
    base
}
