//! Persisted broker configuration
//!
//! A single structured blob at a platform-appropriate location. The blob
//! carries a schema version; unversioned legacy blobs are upgraded in
//! memory on read and rewritten on the next save. A version newer than
//! this build supports is rejected rather than guessed at.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::domain::credential::Credential;
use crate::domain::endpoints::{EndpointOverrides, EndpointSet, OverrideTimestamps};
use crate::domain::token::TokenRecord;
use crate::error::{BrokerError, BrokerResult};

/// Current schema version written by this build.
pub const CONFIG_SCHEMA_VERSION: u32 = 2;

/// MCP transport preference from the persisted config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpPreference {
    #[default]
    Auto,
    Ws,
    Rest,
    Local,
    Cli,
}

impl McpPreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Ws => "ws",
            Self::Rest => "rest",
            Self::Local => "local",
            Self::Cli => "cli",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "ws" => Some(Self::Ws),
            "rest" => Some(Self::Rest),
            "local" => Some(Self::Local),
            "cli" => Some(Self::Cli),
            _ => None,
        }
    }
}

/// Ranking preference selecting the primary transport kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RankingPreference {
    CliFirst,
    WsFirst,
    RestFirst,
    #[default]
    Auto,
}

/// Transport-related user preferences.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportPreferences {
    #[serde(default)]
    pub ranking: RankingPreference,
    /// Command line for the local stdio MCP server. The stdio transport is
    /// absent from candidates when unset; the broker never guesses a binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdio_command: Option<String>,
    /// CLI wrapper binary name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_command: Option<String>,
    /// OAuth callback port override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_port: Option<u16>,
}

/// The persisted configuration blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<EndpointSet>,
    #[serde(default)]
    pub manual_endpoint_overrides: EndpointOverrides,
    #[serde(default)]
    pub transport_preferences: TransportPreferences,
    #[serde(default)]
    pub mcp_preference: McpPreference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_service_discovery: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "OverrideTimestamps::is_empty")]
    pub last_manual_endpoint_update: OverrideTimestamps,
}

impl BrokerConfig {
    /// A fresh config at the current schema version.
    pub fn new() -> Self {
        Self {
            version: CONFIG_SCHEMA_VERSION,
            ..Default::default()
        }
    }

    /// Parse a raw blob, upgrading legacy shapes in memory.
    ///
    /// Returns the config and whether an upgrade happened (the caller
    /// rewrites upgraded blobs on the next save).
    pub fn from_blob(raw: &str) -> BrokerResult<(Self, bool)> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| BrokerError::StorageCorrupted(format!("config does not parse: {}", e)))?;

        let version = value.get("version").and_then(Value::as_u64).unwrap_or(0) as u32;
        if version > CONFIG_SCHEMA_VERSION {
            return Err(BrokerError::StorageCorrupted(format!(
                "config schema version {} is newer than supported {}",
                version, CONFIG_SCHEMA_VERSION
            )));
        }

        if version == 0 {
            let config = Self::upgrade_legacy(value)?;
            return Ok((config, true));
        }

        let mut config: Self = serde_json::from_value(value)
            .map_err(|e| BrokerError::StorageCorrupted(format!("config fields invalid: {}", e)))?;
        let migrated = config.version != CONFIG_SCHEMA_VERSION;
        config.version = CONFIG_SCHEMA_VERSION;
        Ok((config, migrated))
    }

    /// Upgrade an unversioned legacy blob.
    ///
    /// Legacy clients persisted a plaintext `apiKey` string and sometimes a
    /// raw-string access token. The plaintext is hashed here and never
    /// written back; a raw token becomes an already-expired OAuth record so
    /// the first use refreshes or reauthenticates.
    fn upgrade_legacy(value: Value) -> BrokerResult<Self> {
        let mut config = Self::new();

        if let Some(key) = value.get("apiKey").and_then(Value::as_str) {
            info!("[Config] Migrating legacy plaintext apiKey to hashed form");
            config.credentials = Some(Credential::api_key(key));
        } else if let Some(token) = value.get("token").and_then(Value::as_str) {
            info!("[Config] Migrating legacy raw-string token");
            config.credentials = Some(Credential::oauth(TokenRecord {
                access_token: token.to_string(),
                expires_at: 0,
                refresh_token: None,
                scope: Default::default(),
            }));
        } else if let Some(creds) = value.get("credentials") {
            config.credentials = serde_json::from_value(creds.clone()).map_err(|e| {
                BrokerError::StorageCorrupted(format!("legacy credentials invalid: {}", e))
            })?;
        }

        if let Some(endpoints) = value.get("endpoints") {
            config.endpoints = serde_json::from_value(endpoints.clone()).ok();
        }
        if let Some(pref) = value.get("mcpPreference").and_then(Value::as_str) {
            if let Some(parsed) = McpPreference::parse(pref) {
                config.mcp_preference = parsed;
            }
        }

        Ok(config)
    }

    /// Resolved endpoint set: cached discovery shadowed by overrides, or
    /// compiled defaults when nothing was discovered yet.
    pub fn resolved_endpoints(&self) -> EndpointSet {
        let mut set = self
            .endpoints
            .clone()
            .unwrap_or_else(EndpointSet::compiled_defaults);
        self.manual_endpoint_overrides.apply(&mut set);
        set
    }

    /// Record a manual override with its per-field timestamp.
    pub fn pin_endpoint(&mut self, field: &str, value: String, at: DateTime<Utc>) -> bool {
        if !self.manual_endpoint_overrides.set_field(field, value) {
            return false;
        }
        self.last_manual_endpoint_update.insert(field.to_string(), at);
        true
    }

    /// Drop all overrides; the next resolution performs a fresh discovery.
    pub fn clear_endpoint_overrides(&mut self) {
        self.manual_endpoint_overrides = EndpointOverrides::default();
        self.last_manual_endpoint_update.clear();
        self.last_service_discovery = None;
    }
}
