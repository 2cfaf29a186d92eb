//! Structured diagnostics
//!
//! Probes authentication, endpoints, transports, the live MCP session,
//! tool availability, connection quality, and configuration integrity
//! into one report tree. The report is always produced: offline runs
//! yield skips and fails, never a crash. `repair` rewrites a corrupt or
//! incomplete config to safe defaults behind a backup.

use std::sync::Arc;

use lanonasis_core::domain::{
    Credential, DiagnosticReport, DiagnosticSection, DiscoveryStatus, RecommendedAction,
    SectionStatus, TransportState,
};
use lanonasis_core::{domain::credential::is_hashed, error::BrokerError};
use lanonasis_storage::{ConfigStore, CredentialStore};
use tracing::info;

use crate::discovery::ServiceDiscovery;
use crate::registry::TransportRegistry;
use crate::router::RequestRouter;

/// Options for one diagnostics run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticsOptions {
    /// Include per-item detail lines beyond the summaries.
    pub verbose: bool,
    /// Attempt to repair a corrupt or incomplete configuration, backing
    /// up the current bytes first.
    pub repair: bool,
}

/// Diagnostics runner over the broker's collaborators.
pub struct Diagnostics {
    config: Arc<ConfigStore>,
    credentials: Arc<CredentialStore>,
    discovery: Arc<ServiceDiscovery>,
    registry: Arc<TransportRegistry>,
    router: Arc<RequestRouter>,
}

impl Diagnostics {
    pub fn new(
        config: Arc<ConfigStore>,
        credentials: Arc<CredentialStore>,
        discovery: Arc<ServiceDiscovery>,
        registry: Arc<TransportRegistry>,
        router: Arc<RequestRouter>,
    ) -> Self {
        Self {
            config,
            credentials,
            discovery,
            registry,
            router,
        }
    }

    /// Produce the full report. Never fails.
    pub async fn run(&self, options: DiagnosticsOptions) -> DiagnosticReport {
        info!(repair = options.repair, "[Diagnostics] Running");
        let sections = vec![
            self.authentication(options).await,
            self.endpoints(options).await,
            self.transports(options).await,
            self.current_session().await,
            self.tool_availability().await,
            self.connection_quality().await,
            self.configuration_integrity(options).await,
        ];
        DiagnosticReport::new(sections)
    }

    async fn authentication(&self, options: DiagnosticsOptions) -> DiagnosticSection {
        let credential = match self.credentials.get().await {
            Ok(credential) => credential,
            Err(e) => {
                return DiagnosticSection::new("Authentication", SectionStatus::Fail)
                    .detail(e.to_string())
                    .action(action_for(&e));
            }
        };

        match credential {
            None => DiagnosticSection::new("Authentication", SectionStatus::Warn)
                .detail("no credential stored")
                .action(
                    RecommendedAction::new("sign in to the platform").with_command("onasis login"),
                ),
            Some(Credential::ApiKey { .. }) => {
                DiagnosticSection::new("Authentication", SectionStatus::Pass)
                    .detail("active credential: apiKey (hashed)")
            }
            Some(Credential::VendorKey { public_id, .. }) => {
                let mut section = DiagnosticSection::new("Authentication", SectionStatus::Pass)
                    .detail("active credential: vendorKey");
                if options.verbose {
                    section = section.detail(format!("public id: {}", public_id));
                }
                section
            }
            Some(credential @ Credential::Oauth { .. }) => {
                let token = credential.token();
                match token {
                    Some(token) if token.is_valid() => {
                        DiagnosticSection::new("Authentication", SectionStatus::Pass)
                            .detail("active credential: oauth (token valid)")
                    }
                    Some(token) if token.refresh_token.is_some() => {
                        DiagnosticSection::new("Authentication", SectionStatus::Pass)
                            .detail("oauth token expired; will refresh on next use")
                    }
                    _ => DiagnosticSection::new("Authentication", SectionStatus::Fail)
                        .detail("oauth token expired with no refresh token")
                        .action(
                            RecommendedAction::new("your session expired; please sign in again")
                                .with_command("onasis login"),
                        ),
                }
            }
        }
    }

    async fn endpoints(&self, options: DiagnosticsOptions) -> DiagnosticSection {
        match self.discovery.resolve(false).await {
            Ok(resolved) => {
                let mut section = match resolved.status {
                    DiscoveryStatus::Fresh | DiscoveryStatus::Cached => {
                        DiagnosticSection::new("Endpoints", SectionStatus::Pass)
                            .detail(format!("source: {:?}", resolved.status))
                    }
                    DiscoveryStatus::Fallback => {
                        DiagnosticSection::new("Endpoints", SectionStatus::Warn)
                            .detail("discovery unavailable; compiled defaults in use")
                            .action(RecommendedAction::new(
                                "verify network access or pin endpoints manually",
                            ))
                    }
                };
                if options.verbose {
                    for (name, url) in resolved.endpoints.url_fields() {
                        section = section.detail(format!("{}: {}", name, url));
                    }
                }
                section
            }
            Err(e) => DiagnosticSection::new("Endpoints", SectionStatus::Fail)
                .detail(e.to_string())
                .action(action_for(&e)),
        }
    }

    async fn transports(&self, _options: DiagnosticsOptions) -> DiagnosticSection {
        let descriptors = self.registry.descriptors();
        if descriptors.is_empty() {
            return DiagnosticSection::new("Transports", SectionStatus::Skip)
                .detail("no transports registered yet (no dispatch has run)");
        }

        let mut parent = DiagnosticSection::new("Transports", SectionStatus::Pass);
        for descriptor in descriptors {
            let probe = self.registry.probe(&descriptor.id).await;
            let child = match probe {
                Ok(true) => {
                    let latency = self
                        .registry
                        .descriptors()
                        .into_iter()
                        .find(|d| d.id == descriptor.id)
                        .and_then(|d| d.last_health.map(|h| h.latency_ms));
                    DiagnosticSection::new(descriptor.id.clone(), SectionStatus::Pass).detail(
                        match latency {
                            Some(ms) => format!("{} probe ok ({} ms)", descriptor.kind, ms),
                            None => format!("{} probe ok", descriptor.kind),
                        },
                    )
                }
                Ok(false) => DiagnosticSection::new(descriptor.id.clone(), SectionStatus::Fail)
                    .detail(format!("{} probe failed", descriptor.kind))
                    .action(RecommendedAction::new(
                        "check connectivity to this endpoint or disable the transport",
                    )),
                Err(e) => DiagnosticSection::new(descriptor.id.clone(), SectionStatus::Skip)
                    .detail(e.to_string()),
            };
            parent = parent.child(child);
        }
        parent
    }

    async fn current_session(&self) -> DiagnosticSection {
        let sessions = self.router.active_sessions().await;
        if sessions.is_empty() {
            return DiagnosticSection::new("Current MCP Session", SectionStatus::Skip)
                .detail("no active session");
        }
        let mut section = DiagnosticSection::new("Current MCP Session", SectionStatus::Pass);
        for (transport, server) in sessions {
            section = section.detail(match server {
                Some(server) => format!("{} -> {}", transport, server),
                None => transport,
            });
        }
        section
    }

    async fn tool_availability(&self) -> DiagnosticSection {
        match self.router.any_session_tools().await {
            Some(tools) if tools.is_empty() => {
                DiagnosticSection::new("Tool Availability", SectionStatus::Warn)
                    .detail("session is live but advertises no tools")
            }
            Some(tools) => DiagnosticSection::new("Tool Availability", SectionStatus::Pass)
                .detail(format!("{} tools available", tools.len())),
            None => DiagnosticSection::new("Tool Availability", SectionStatus::Skip)
                .detail("no live MCP session to query"),
        }
    }

    async fn connection_quality(&self) -> DiagnosticSection {
        let descriptors = self.registry.descriptors();
        let sampled: Vec<_> = descriptors
            .iter()
            .filter_map(|d| d.last_health.as_ref().map(|h| (d, h)))
            .collect();
        if sampled.is_empty() {
            return DiagnosticSection::new("Connection Quality", SectionStatus::Skip)
                .detail("no health samples yet");
        }

        let any_ready = descriptors
            .iter()
            .any(|d| d.state == TransportState::Ready);
        let status = if any_ready {
            SectionStatus::Pass
        } else {
            SectionStatus::Warn
        };
        let mut section = DiagnosticSection::new("Connection Quality", status);
        for (descriptor, health) in sampled {
            section = section.detail(format!(
                "{}: {} ms ({:?})",
                descriptor.id, health.latency_ms, descriptor.state
            ));
        }
        section
    }

    async fn configuration_integrity(&self, options: DiagnosticsOptions) -> DiagnosticSection {
        // (a) config exists and parses
        let config = match self.config.load().await {
            Ok(config) => config,
            Err(e) => {
                if options.repair {
                    return self.repair_config(e).await;
                }
                return DiagnosticSection::new("Configuration Integrity", SectionStatus::Fail)
                    .detail(e.to_string())
                    .action(
                        RecommendedAction::new("repair the configuration")
                            .with_command("onasis doctor --repair"),
                    );
            }
        };

        let mut status = SectionStatus::Pass;
        let mut section_details: Vec<String> = Vec::new();
        let mut actions: Vec<RecommendedAction> = Vec::new();

        // (b) credential shape agrees with its declared kind
        match &config.credentials {
            Some(Credential::ApiKey { hash }) if !is_hashed(hash) => {
                status = status.max(SectionStatus::Fail);
                section_details.push("stored apiKey is not a SHA-256 hash".to_string());
                actions.push(
                    RecommendedAction::new("re-enter the API key").with_command("onasis login"),
                );
            }
            Some(Credential::VendorKey { public_id, .. }) if !public_id.starts_with("pk_") => {
                status = status.max(SectionStatus::Warn);
                section_details.push("vendor key public id has unexpected shape".to_string());
            }
            _ => {}
        }

        // (c) endpoint URLs parse as absolute
        if let Err(e) = config.resolved_endpoints().validate() {
            status = status.max(SectionStatus::Fail);
            section_details.push(e.to_string());
            actions.push(RecommendedAction::new("fix the pinned endpoint URLs"));
        }

        // (d) a backup exists
        match self.config.backups().await {
            Ok(backups) if backups.is_empty() => {
                status = status.max(SectionStatus::Warn);
                section_details.push("no config backup exists yet".to_string());
            }
            Ok(backups) => {
                section_details.push(format!("{} backup(s) present", backups.len()));
            }
            Err(_) => {
                section_details.push("backup listing unavailable for this backend".to_string());
            }
        }

        // (e) MCP preference is one of the legal values (a parse failure
        // would have surfaced in (a); record the active value).
        section_details.push(format!(
            "mcpPreference: {}",
            config.mcp_preference.as_str()
        ));

        let mut section = DiagnosticSection::new("Configuration Integrity", status);
        for detail in section_details {
            section = section.detail(detail);
        }
        for action in actions {
            section = section.action(action);
        }
        section
    }

    async fn repair_config(&self, original: BrokerError) -> DiagnosticSection {
        match self.config.repair().await {
            Ok(outcome) => {
                let mut section =
                    DiagnosticSection::new("Configuration Integrity", SectionStatus::Warn)
                        .detail(format!("config was corrupt: {}", original))
                        .action(RecommendedAction::new(
                            "configuration was recreated with defaults; sign in again",
                        ));
                if let Some(backup) = outcome.corrupt_backup {
                    section = section.detail(format!("original bytes kept as {}", backup));
                }
                section
            }
            Err(e) => DiagnosticSection::new("Configuration Integrity", SectionStatus::Fail)
                .detail(format!("repair failed: {}", e))
                .action(RecommendedAction::new(
                    "check permissions on the configuration directory",
                )),
        }
    }
}

fn action_for(error: &BrokerError) -> RecommendedAction {
    match error.recommended_action() {
        Some(action) => RecommendedAction::new(action),
        None => RecommendedAction::new("run diagnostics with verbose output for more detail"),
    }
}
