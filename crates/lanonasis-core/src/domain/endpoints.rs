//! Endpoint resolution model
//!
//! The `EndpointSet` is filled by service discovery, refreshed on demand,
//! and shadowed field-by-field by explicit user overrides. Overrides are
//! preserved across discovery refreshes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::defaults;
use crate::error::{BrokerError, BrokerResult};

/// The resolved endpoint families.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSet {
    pub auth_base: String,
    pub memory_base: String,
    pub mcp_rest_base: String,
    pub mcp_ws_base: String,
    pub mcp_sse_base: String,
    pub project_scope: String,
}

impl EndpointSet {
    /// The compiled-in fallback set.
    pub fn compiled_defaults() -> Self {
        Self {
            auth_base: defaults::DEFAULT_AUTH_BASE.to_string(),
            memory_base: defaults::DEFAULT_MEMORY_BASE.to_string(),
            mcp_rest_base: defaults::DEFAULT_MCP_REST_BASE.to_string(),
            mcp_ws_base: defaults::DEFAULT_MCP_WS_BASE.to_string(),
            mcp_sse_base: defaults::DEFAULT_MCP_SSE_BASE.to_string(),
            project_scope: "default".to_string(),
        }
    }

    /// Validate that every endpoint parses as an absolute URL and that the
    /// WebSocket base uses a `ws`/`wss` scheme.
    pub fn validate(&self) -> BrokerResult<()> {
        for (name, value) in self.url_fields() {
            let url = Url::parse(value).map_err(|e| {
                BrokerError::DiscoveryFailed(format!("{} is not an absolute URL: {}", name, e))
            })?;
            if url.cannot_be_a_base() {
                return Err(BrokerError::DiscoveryFailed(format!(
                    "{} is not an absolute URL",
                    name
                )));
            }
        }
        let ws = Url::parse(&self.mcp_ws_base)
            .map_err(|e| BrokerError::DiscoveryFailed(format!("mcpWsBase: {}", e)))?;
        if ws.scheme() != "ws" && ws.scheme() != "wss" {
            return Err(BrokerError::DiscoveryFailed(format!(
                "mcpWsBase must use ws:// or wss://, got {}",
                ws.scheme()
            )));
        }
        Ok(())
    }

    /// URL-valued fields by their serialized names.
    pub fn url_fields(&self) -> [(&'static str, &str); 5] {
        [
            ("authBase", &self.auth_base),
            ("memoryBase", &self.memory_base),
            ("mcpRestBase", &self.mcp_rest_base),
            ("mcpWsBase", &self.mcp_ws_base),
            ("mcpSseBase", &self.mcp_sse_base),
        ]
    }

    /// Full OAuth authorization endpoint URL.
    pub fn authorize_url(&self) -> String {
        format!(
            "{}{}",
            self.auth_base.trim_end_matches('/'),
            defaults::OAUTH_AUTHORIZE_PATH
        )
    }

    /// Full OAuth token endpoint URL.
    pub fn token_url(&self) -> String {
        format!(
            "{}{}",
            self.auth_base.trim_end_matches('/'),
            defaults::OAUTH_TOKEN_PATH
        )
    }
}

impl Default for EndpointSet {
    fn default() -> Self {
        Self::compiled_defaults()
    }
}

/// The well-known service discovery document.
///
/// Missing fields fall back to compiled defaults; `mcp_base` covers both
/// the REST base and, with a `/sse` suffix, the SSE base when the document
/// does not name one explicitly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    #[serde(default)]
    pub auth_base: Option<String>,
    #[serde(default)]
    pub memory_base: Option<String>,
    #[serde(default)]
    pub mcp_base: Option<String>,
    #[serde(default)]
    pub mcp_ws_base: Option<String>,
    #[serde(default)]
    pub mcp_sse_base: Option<String>,
    #[serde(default)]
    pub project_scope: Option<String>,
}

impl DiscoveryDocument {
    /// Resolve the document into a full endpoint set, filling gaps from the
    /// compiled defaults.
    pub fn into_endpoint_set(self) -> EndpointSet {
        let fallback = EndpointSet::compiled_defaults();
        let mcp_sse_base = self.mcp_sse_base.or_else(|| {
            self.mcp_base
                .as_ref()
                .map(|base| format!("{}/sse", base.trim_end_matches('/')))
        });
        EndpointSet {
            auth_base: self.auth_base.unwrap_or(fallback.auth_base),
            memory_base: self.memory_base.unwrap_or(fallback.memory_base),
            mcp_rest_base: self.mcp_base.unwrap_or(fallback.mcp_rest_base),
            mcp_ws_base: self.mcp_ws_base.unwrap_or(fallback.mcp_ws_base),
            mcp_sse_base: mcp_sse_base.unwrap_or(fallback.mcp_sse_base),
            project_scope: self.project_scope.unwrap_or(fallback.project_scope),
        }
    }
}

/// How the current endpoint set was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    /// Fetched from the well-known document during this resolution.
    Fresh,
    /// Served from the persisted cache.
    Cached,
    /// Discovery failed with no cache; compiled defaults in use.
    Fallback,
}

/// Per-field manual endpoint overrides.
///
/// Pinned fields shadow discovered values verbatim and survive discovery
/// refreshes; clearing them forces a fresh discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_rest_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_ws_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_sse_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_scope: Option<String>,
}

impl EndpointOverrides {
    pub fn is_empty(&self) -> bool {
        self.auth_base.is_none()
            && self.memory_base.is_none()
            && self.mcp_rest_base.is_none()
            && self.mcp_ws_base.is_none()
            && self.mcp_sse_base.is_none()
            && self.project_scope.is_none()
    }

    /// Apply pinned fields over a discovered set.
    pub fn apply(&self, set: &mut EndpointSet) {
        if let Some(v) = &self.auth_base {
            set.auth_base = v.clone();
        }
        if let Some(v) = &self.memory_base {
            set.memory_base = v.clone();
        }
        if let Some(v) = &self.mcp_rest_base {
            set.mcp_rest_base = v.clone();
        }
        if let Some(v) = &self.mcp_ws_base {
            set.mcp_ws_base = v.clone();
        }
        if let Some(v) = &self.mcp_sse_base {
            set.mcp_sse_base = v.clone();
        }
        if let Some(v) = &self.project_scope {
            set.project_scope = v.clone();
        }
    }

    /// Set a field by its serialized name, returning whether the name was
    /// recognized. Used by env-var overrides and the config surface.
    pub fn set_field(&mut self, field: &str, value: String) -> bool {
        match field {
            "authBase" => self.auth_base = Some(value),
            "memoryBase" => self.memory_base = Some(value),
            "mcpRestBase" => self.mcp_rest_base = Some(value),
            "mcpWsBase" => self.mcp_ws_base = Some(value),
            "mcpSseBase" => self.mcp_sse_base = Some(value),
            "projectScope" => self.project_scope = Some(value),
            _ => return false,
        }
        true
    }

    /// Names of the pinned fields.
    pub fn pinned_fields(&self) -> Vec<&'static str> {
        let mut pinned = Vec::new();
        if self.auth_base.is_some() {
            pinned.push("authBase");
        }
        if self.memory_base.is_some() {
            pinned.push("memoryBase");
        }
        if self.mcp_rest_base.is_some() {
            pinned.push("mcpRestBase");
        }
        if self.mcp_ws_base.is_some() {
            pinned.push("mcpWsBase");
        }
        if self.mcp_sse_base.is_some() {
            pinned.push("mcpSseBase");
        }
        if self.project_scope.is_some() {
            pinned.push("projectScope");
        }
        pinned
    }
}

/// Timestamp map for per-field manual updates, keyed by serialized field
/// name.
pub type OverrideTimestamps = std::collections::BTreeMap<String, DateTime<Utc>>;
