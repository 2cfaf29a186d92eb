//! Core domain entities

pub mod config;
pub mod credential;
pub mod diagnostics;
pub mod endpoints;
pub mod token;
pub mod transport;

pub use config::{
    BrokerConfig, McpPreference, RankingPreference, TransportPreferences, CONFIG_SCHEMA_VERSION,
};
pub use credential::{is_hashed, sha256_hex, AuthMaterial, Credential, VendorKey};
pub use diagnostics::{DiagnosticReport, DiagnosticSection, RecommendedAction, SectionStatus};
pub use endpoints::{
    DiscoveryDocument, DiscoveryStatus, EndpointOverrides, EndpointSet, OverrideTimestamps,
};
pub use token::{now_ms, TokenRecord};
pub use transport::{
    HealthResult, TransportDescriptor, TransportKind, TransportState, FAILURES_TO_DEGRADE,
};
