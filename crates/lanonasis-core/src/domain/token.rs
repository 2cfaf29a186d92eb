//! OAuth token record and validity rules

use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::defaults::{DEFAULT_TOKEN_LIFETIME_SECS, TOKEN_EXPIRY_BUFFER_MS};

/// A stored OAuth token pair.
///
/// `expires_at` is epoch milliseconds and is monotonic across refreshes for
/// a given refresh-token chain; the token lifecycle rejects a refresh that
/// would move it backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub access_token: String,
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub scope: BTreeSet<String>,
}

impl TokenRecord {
    /// Build a record from a token endpoint response. Missing `expires_in`
    /// defaults to one hour.
    pub fn from_response(
        access_token: String,
        refresh_token: Option<String>,
        expires_in_secs: Option<u64>,
        scope: BTreeSet<String>,
        now_ms: i64,
    ) -> Self {
        let lifetime = expires_in_secs.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        Self {
            access_token,
            expires_at: now_ms + (lifetime as i64) * 1000,
            refresh_token,
            scope,
        }
    }

    /// A token is valid iff `now + 60s < expires_at`. The buffer keeps
    /// in-flight requests from racing expiry; equality counts as invalid.
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        now_ms + TOKEN_EXPIRY_BUFFER_MS < self.expires_at
    }

    /// Validity against the wall clock.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(now_ms())
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
