//! Broker error taxonomy
//!
//! Every failure surfaced by the broker carries one of these kinds. The
//! router consumes transport-level kinds and escalates; auth, terminal, and
//! rate-limit kinds pass through to the caller. Each user-visible kind maps
//! to a recommended remediation string that diagnostics can render in bulk.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the broker crates.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Terminal server rejection categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    /// Request failed server-side validation.
    Validation,
    /// Resource does not exist.
    NotFound,
    /// Resource state conflict.
    Conflict,
    /// Credential is valid but not permitted (403).
    Forbidden,
}

/// Outcome of one transport candidate inside an exhausted dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateOutcome {
    /// Transport descriptor id.
    pub transport_id: String,
    /// Short failure summary for that candidate.
    pub summary: String,
}

/// The broker failure taxonomy.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Persisted blob failed to parse, or its schema version is newer than
    /// this build supports.
    #[error("stored configuration is corrupted: {0}")]
    StorageCorrupted(String),

    /// Local storage exists but cannot be written.
    #[error("stored configuration cannot be written: {0}")]
    StorageUnwritable(String),

    /// The fixed callback port is already bound by another process. The
    /// browser is never opened in this case.
    #[error("callback port {0} is already in use")]
    PortUnavailable(u16),

    /// Loopback bind failed for a reason other than address-in-use.
    #[error("failed to bind the OAuth callback listener: {0}")]
    CallbackBindFailed(String),

    /// Callback state did not match the value sent with the authorization
    /// request; the received code is discarded without redemption.
    #[error("OAuth state parameter mismatch")]
    StateMismatch,

    /// The authorization server returned an error on the callback.
    #[error("authorization denied: {error}{}", .description.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    AuthorizationDenied {
        error: String,
        description: Option<String>,
    },

    /// No callback arrived within the flow timeout.
    #[error("timed out waiting for the OAuth callback")]
    AuthorizationTimeout,

    /// Credential is invalid and cannot be refreshed; a new interactive
    /// authorization is required.
    #[error("session expired; re-authentication required")]
    ReauthenticationRequired,

    /// Token refresh failed for a temporary reason after exhausting the
    /// retry budget.
    #[error("token refresh temporarily failed: {0}")]
    TokenRefreshTransient(String),

    /// Endpoint discovery failed; compiled defaults were used if available.
    #[error("service discovery failed: {0}")]
    DiscoveryFailed(String),

    /// A transport could not be reached (connection refused, timeout, 5xx).
    #[error("transport {transport} unreachable: {message}")]
    TransportUnreachable { transport: String, message: String },

    /// A transport rejected the presented credential.
    #[error("transport {transport} rejected authentication: {message}")]
    TransportAuthRejected { transport: String, message: String },

    /// A transport produced a response that violates its protocol.
    #[error("transport {transport} protocol violation: {message}")]
    TransportProtocolViolation { transport: String, message: String },

    /// Every candidate transport failed; the per-candidate outcomes are
    /// attached for diagnostics.
    #[error("no transport available ({} candidates failed)", .attempts.len())]
    NoTransportAvailable { attempts: Vec<CandidateOutcome> },

    /// Throttled by the server after the retry budget was exhausted.
    #[error("rate limited{}", .retry_after.map(|d| format!("; retry after {}s", d.as_secs())).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    /// Terminal server rejection (validation, not-found, conflict, forbidden).
    #[error("operation rejected ({kind:?}): {message}")]
    OperationRejected {
        kind: RejectionKind,
        message: String,
    },

    /// Cooperative cancellation by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

impl BrokerError {
    /// Whether the router may try the next transport candidate after this
    /// failure. Auth, terminal, and rate-limit errors are never escalated
    /// past; transport-level failures are.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransportUnreachable { .. } | Self::TokenRefreshTransient(_)
        )
    }

    /// Whether this failure means the credential itself is bad.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::ReauthenticationRequired | Self::TransportAuthRejected { .. }
        )
    }

    /// Recommended remediation for user-visible kinds.
    pub fn recommended_action(&self) -> Option<String> {
        match self {
            Self::PortUnavailable(port) => Some(format!(
                "close the application using port {} or configure a different callback port",
                port
            )),
            Self::CallbackBindFailed(_) => {
                Some("check firewall rules for loopback connections".to_string())
            }
            Self::StateMismatch => {
                Some("restart the sign-in flow; do not reuse old browser tabs".to_string())
            }
            Self::AuthorizationDenied { .. } => {
                Some("approve the authorization request in the browser".to_string())
            }
            Self::AuthorizationTimeout => {
                Some("restart the sign-in flow and complete it within five minutes".to_string())
            }
            Self::ReauthenticationRequired => {
                Some("your session expired; please sign in again".to_string())
            }
            Self::StorageCorrupted(_) => {
                Some("run diagnostics with repair to rebuild the configuration".to_string())
            }
            Self::StorageUnwritable(_) => {
                Some("check permissions on the configuration directory".to_string())
            }
            Self::DiscoveryFailed(_) => {
                Some("verify network access or pin endpoints manually".to_string())
            }
            Self::NoTransportAvailable { .. } => {
                Some("run diagnostics to inspect per-transport health".to_string())
            }
            Self::RateLimited { .. } => Some("wait before retrying".to_string()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BrokerError::TransportUnreachable {
            transport: "ws".into(),
            message: "connection refused".into()
        }
        .is_transient());
        assert!(!BrokerError::ReauthenticationRequired.is_transient());
        assert!(!BrokerError::OperationRejected {
            kind: RejectionKind::Validation,
            message: "bad title".into()
        }
        .is_transient());
    }

    #[test]
    fn test_auth_classification() {
        assert!(BrokerError::ReauthenticationRequired.is_auth());
        assert!(BrokerError::TransportAuthRejected {
            transport: "http".into(),
            message: "401".into()
        }
        .is_auth());
        assert!(!BrokerError::Cancelled.is_auth());
    }

    #[test]
    fn test_recommended_actions_present() {
        assert!(BrokerError::PortUnavailable(8080)
            .recommended_action()
            .unwrap()
            .contains("8080"));
        assert!(BrokerError::ReauthenticationRequired
            .recommended_action()
            .unwrap()
            .contains("sign in"));
        assert!(BrokerError::Cancelled.recommended_action().is_none());
    }

    #[test]
    fn test_display_messages() {
        let err = BrokerError::AuthorizationDenied {
            error: "access_denied".into(),
            description: Some("User denied access".into()),
        };
        assert_eq!(
            err.to_string(),
            "authorization denied: access_denied (User denied access)"
        );

        let err = BrokerError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.to_string(), "rate limited; retry after 30s");
    }
}
