//! Compiled-in defaults and platform constants
//!
//! All service endpoints, environment variable names, and timeout values
//! come from this module. Discovery and user configuration override these
//! at runtime; they are the floor the broker can always fall back to.

use std::time::Duration;

/// Default auth gateway base URL.
pub const DEFAULT_AUTH_BASE: &str = "https://auth.lanonasis.com";

/// Default memory REST API base URL.
pub const DEFAULT_MEMORY_BASE: &str = "https://api.lanonasis.com";

/// Default MCP HTTP base URL.
pub const DEFAULT_MCP_REST_BASE: &str = "https://mcp.lanonasis.com";

/// Default MCP WebSocket base URL.
pub const DEFAULT_MCP_WS_BASE: &str = "wss://mcp.lanonasis.com/ws";

/// Default MCP SSE base URL.
pub const DEFAULT_MCP_SSE_BASE: &str = "https://mcp.lanonasis.com/sse";

/// Well-known service discovery document path.
pub const DISCOVERY_PATH: &str = "/.well-known/onasis.json";

/// OAuth authorization endpoint path on the auth base.
pub const OAUTH_AUTHORIZE_PATH: &str = "/oauth/authorize";

/// OAuth token endpoint path on the auth base.
pub const OAUTH_TOKEN_PATH: &str = "/oauth/token";

/// Default loopback port for the OAuth callback listener.
pub const DEFAULT_OAUTH_CALLBACK_PORT: u16 = 8080;

/// Path served by the loopback callback listener. Everything else is 404.
pub const OAUTH_CALLBACK_PATH: &str = "/callback";

/// OS keychain service name for the keychain storage backend.
pub const KEYCHAIN_SERVICE: &str = "com.lanonasis.broker";

/// Config file name inside the platform config directory.
pub const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the memory REST base URL.
pub const ENV_API_URL: &str = "LANONASIS_API_URL";

/// Environment variable overriding the auth base URL.
pub const ENV_AUTH_URL: &str = "LANONASIS_AUTH_URL";

/// Environment variable overriding the MCP base URL.
pub const ENV_MCP_URL: &str = "LANONASIS_MCP_URL";

/// Environment variable carrying an API key; also how child processes
/// (stdio MCP server, CLI wrapper) inherit the active credential.
pub const ENV_API_KEY: &str = "LANONASIS_API_KEY";

/// Truthy values enable verbose diagnostic logging.
pub const ENV_VERBOSE: &str = "LANONASIS_VERBOSE";

/// Validity buffer subtracted from token expiry: a token within 60 s of
/// expiring is treated as already expired so in-flight requests never race
/// the server clock.
pub const TOKEN_EXPIRY_BUFFER_MS: i64 = 60_000;

/// Default OAuth token lifetime when the server omits `expires_in`.
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

/// Service discovery cache lifetime.
pub const DISCOVERY_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-operation timeout defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Direct REST calls.
    pub rest: Duration,
    /// WebSocket handshake.
    pub ws_handshake: Duration,
    /// MCP tool invocation.
    pub tool_call: Duration,
    /// OAuth callback wait.
    pub oauth_callback: Duration,
    /// Service discovery fetch.
    pub discovery: Duration,
    /// Transport health probe.
    pub health_probe: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            rest: Duration::from_secs(30),
            ws_handshake: Duration::from_secs(10),
            tool_call: Duration::from_secs(60),
            oauth_callback: Duration::from_secs(300),
            discovery: Duration::from_secs(10),
            health_probe: Duration::from_secs(10),
        }
    }
}

/// Build the loopback redirect URI for a callback port.
///
/// The listener binds to 127.0.0.1 only; the URI uses `localhost` because
/// that is what the auth gateway has registered for native clients.
pub fn oauth_redirect_uri(port: u16) -> String {
    format!("http://localhost:{}{}", port, OAUTH_CALLBACK_PATH)
}

/// Check whether an environment value counts as truthy for `LANONASIS_VERBOSE`.
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_uri_shape() {
        assert_eq!(
            oauth_redirect_uri(8080),
            "http://localhost:8080/callback"
        );
        assert_eq!(
            oauth_redirect_uri(51234),
            "http://localhost:51234/callback"
        );
    }

    #[test]
    fn test_truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy("true"));
        assert!(is_truthy(" TRUE "));
        assert!(is_truthy("yes"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("false"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn test_default_timeouts() {
        let t = Timeouts::default();
        assert_eq!(t.rest, Duration::from_secs(30));
        assert_eq!(t.oauth_callback, Duration::from_secs(300));
        assert_eq!(t.tool_call, Duration::from_secs(60));
    }
}
