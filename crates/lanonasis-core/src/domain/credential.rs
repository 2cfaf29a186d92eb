//! Credential entity - the active credential and its persisted shape
//!
//! Exactly one credential is active at a time. API keys and vendor keys are
//! persisted as SHA-256 hashes only; the plaintext never survives the first
//! write. OAuth credentials carry the structured token record.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::domain::token::TokenRecord;

/// Compute the lowercase SHA-256 hex digest of an input string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Detect the 64-char hex shape of an already-hashed key.
///
/// Inputs of this shape pass through persistence unchanged; everything else
/// is hashed first.
pub fn is_hashed(input: &str) -> bool {
    input.len() == 64 && input.chars().all(|c| c.is_ascii_hexdigit())
}

/// A parsed vendor key of the shape `pk_<id>.sk_<secret>`.
///
/// Only the hash of the full concatenation is ever sent or stored; the
/// public id survives for display and correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VendorKey {
    pub public_id: String,
    secret_hash: String,
}

impl VendorKey {
    /// Parse a raw vendor key. Returns `None` when the input does not match
    /// the `pk_<id>.sk_<secret>` shape.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = Zeroizing::new(raw.to_string());
        let (public_part, secret_part) = raw.split_once('.')?;
        if !public_part.starts_with("pk_") || !secret_part.starts_with("sk_") {
            return None;
        }
        if public_part.len() <= 3 || secret_part.len() <= 3 {
            return None;
        }
        Some(Self {
            public_id: public_part.to_string(),
            secret_hash: sha256_hex(&raw),
        })
    }

    pub fn secret_hash(&self) -> &str {
        &self.secret_hash
    }
}

/// The active credential, tagged by kind.
///
/// Serialized form matches the persisted config layout: a `kind` tag with
/// camelCase fields. Plaintext API keys are rejected at construction, not
/// at serialization, so a `Credential` value is always safe to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Credential {
    /// Hashed API key.
    #[serde(rename_all = "camelCase")]
    ApiKey { hash: String },

    /// OAuth token pair.
    #[serde(rename_all = "camelCase")]
    Oauth {
        access_token: String,
        /// Epoch milliseconds.
        expires_at: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
        scope: BTreeSet<String>,
    },

    /// Vendor application key, hashed as the `pk_*.sk_*` concatenation.
    #[serde(rename_all = "camelCase")]
    VendorKey {
        public_id: String,
        secret_hash: String,
    },
}

impl Credential {
    /// Build an API key credential, hashing the plaintext unless the input
    /// already has the 64-char hex shape.
    pub fn api_key(key: &str) -> Self {
        let key = Zeroizing::new(key.to_string());
        let hash = if is_hashed(&key) {
            key.to_string()
        } else {
            sha256_hex(&key)
        };
        Self::ApiKey { hash }
    }

    /// Build an OAuth credential from a token record.
    pub fn oauth(token: TokenRecord) -> Self {
        Self::Oauth {
            access_token: token.access_token,
            expires_at: token.expires_at,
            refresh_token: token.refresh_token,
            scope: token.scope,
        }
    }

    /// Build a vendor key credential from a parsed vendor key.
    pub fn vendor_key(key: &VendorKey) -> Self {
        Self::VendorKey {
            public_id: key.public_id.clone(),
            secret_hash: key.secret_hash.clone(),
        }
    }

    /// Extract the token record from an OAuth credential.
    pub fn token(&self) -> Option<TokenRecord> {
        match self {
            Self::Oauth {
                access_token,
                expires_at,
                refresh_token,
                scope,
            } => Some(TokenRecord {
                access_token: access_token.clone(),
                expires_at: *expires_at,
                refresh_token: refresh_token.clone(),
                scope: scope.clone(),
            }),
            _ => None,
        }
    }

    /// Whether this is an OAuth credential (refreshable).
    pub fn is_oauth(&self) -> bool {
        matches!(self, Self::Oauth { .. })
    }

    /// Stable kind tag, matching the serialized form.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApiKey { .. } => "apiKey",
            Self::Oauth { .. } => "oauth",
            Self::VendorKey { .. } => "vendorKey",
        }
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never render secret material
        match self {
            Self::ApiKey { .. } => write!(f, "apiKey(sha256)"),
            Self::Oauth { expires_at, .. } => write!(f, "oauth(expires_at={})", expires_at),
            Self::VendorKey { public_id, .. } => write!(f, "vendorKey({})", public_id),
        }
    }
}

/// Resolved credential material ready for transport presentation.
///
/// Produced once by the token lifecycle; transports only choose where the
/// value goes (header, handshake, child environment), never what it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMaterial {
    /// OAuth access token, presented as `Authorization: Bearer …`.
    Bearer(String),
    /// Hashed API or vendor key, presented as `X-API-Key: <hash>`.
    ApiKeyHash(String),
}

impl AuthMaterial {
    /// Header name/value pair for HTTP-shaped transports.
    pub fn header(&self) -> (&'static str, String) {
        match self {
            Self::Bearer(token) => ("Authorization", format!("Bearer {}", token)),
            Self::ApiKeyHash(hash) => ("X-API-Key", hash.clone()),
        }
    }

    /// Environment value inherited by child processes (stdio MCP server,
    /// CLI wrapper).
    pub fn env_value(&self) -> &str {
        match self {
            Self::Bearer(token) => token,
            Self::ApiKeyHash(hash) => hash,
        }
    }
}
