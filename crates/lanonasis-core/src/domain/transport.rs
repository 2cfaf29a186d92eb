//! Transport descriptors and the health state machine
//!
//! The registry owns the observable health state; the router reports
//! dispatch outcomes and the registry folds them through the same machine
//! as explicit probes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Consecutive failures that demote a `ready` transport to `degraded`.
/// One further failure demotes to `failed`; a single success promotes back.
pub const FAILURES_TO_DEGRADE: u32 = 2;

/// Concrete dispatch mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Subprocess CLI wrapper.
    Cli,
    /// Local stdio MCP child process.
    Stdio,
    /// Remote WebSocket MCP.
    Ws,
    /// Remote HTTP MCP.
    Http,
    /// SSE-augmented HTTP MCP.
    Sse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::Stdio => "stdio",
            Self::Ws => "ws",
            Self::Http => "http",
            Self::Sse => "sse",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cli" => Some(Self::Cli),
            "stdio" => Some(Self::Stdio),
            "ws" => Some(Self::Ws),
            "http" => Some(Self::Http),
            "sse" => Some(Self::Sse),
            _ => None,
        }
    }

    /// Whether this transport runs as a local child process.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Cli | Self::Stdio)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable transport lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    Unknown,
    Probing,
    Ready,
    Degraded,
    Failed,
}

/// Result of the most recent probe or dispatch outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResult {
    pub ok: bool,
    pub latency_ms: u64,
    pub checked_at: DateTime<Utc>,
}

/// A registered transport with its ranking inputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: String,
    pub kind: TransportKind,
    /// Remote transports carry the endpoint URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Local transports carry the spawn command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Lower is preferred.
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health: Option<HealthResult>,
    pub state: TransportState,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl TransportDescriptor {
    pub fn new(id: impl Into<String>, kind: TransportKind, priority: i32) -> Self {
        Self {
            id: id.into(),
            kind,
            url: None,
            command: None,
            priority,
            last_health: None,
            state: TransportState::Unknown,
            consecutive_failures: 0,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Fold an outcome (probe or dispatch) into the health state machine.
    ///
    /// One success promotes any state to `ready`. A `ready` transport
    /// tolerates one failure; the second demotes to `degraded` and the
    /// third to `failed`. Transports that were never ready skip the grace
    /// failure.
    pub fn record_outcome(&mut self, ok: bool, latency_ms: u64, checked_at: DateTime<Utc>) {
        self.last_health = Some(HealthResult {
            ok,
            latency_ms,
            checked_at,
        });

        if ok {
            self.consecutive_failures = 0;
            self.state = TransportState::Ready;
            return;
        }

        self.consecutive_failures += 1;
        self.state = match self.state {
            TransportState::Ready => {
                if self.consecutive_failures >= FAILURES_TO_DEGRADE {
                    TransportState::Degraded
                } else {
                    TransportState::Ready
                }
            }
            TransportState::Degraded => TransportState::Failed,
            TransportState::Unknown | TransportState::Probing => TransportState::Degraded,
            TransportState::Failed => TransportState::Failed,
        };
    }

    /// Fold a hard failure (dispatch-time connection refusal or the like)
    /// into the state machine. Unlike probe failures, a hard failure
    /// demotes a `ready` transport immediately; it is stronger evidence
    /// than a missed probe.
    pub fn record_hard_failure(&mut self, latency_ms: u64, checked_at: DateTime<Utc>) {
        self.last_health = Some(HealthResult {
            ok: false,
            latency_ms,
            checked_at,
        });
        self.consecutive_failures += 1;
        self.state = match self.state {
            TransportState::Ready | TransportState::Unknown | TransportState::Probing => {
                TransportState::Degraded
            }
            TransportState::Degraded | TransportState::Failed => TransportState::Failed,
        };
    }

    /// Latency of the last health sample, used as a ranking tiebreaker.
    pub fn last_latency_ms(&self) -> u64 {
        self.last_health
            .as_ref()
            .map(|h| h.latency_ms)
            .unwrap_or(u64::MAX)
    }
}
