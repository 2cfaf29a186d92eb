//! MCP transport implementations
//!
//! - Stdio: local child process, newline-delimited JSON
//! - WebSocket: one JSON message per text frame
//! - HTTP / SSE: POST per request, optional server-push notification stream
//!
//! Every transport feeds inbound frames through an internal channel; the
//! client drains them with `recv` and correlates responses by id.

use std::sync::Arc;

use async_trait::async_trait;
use lanonasis_core::domain::TransportKind;
use lanonasis_core::error::BrokerResult;

pub mod http;
pub mod stdio;
pub mod ws;

pub use http::HttpTransport;
pub use stdio::StdioTransport;
pub use ws::{reconnect_delay, WsTransport};

/// A connected MCP transport.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Which transport family this is; used for error attribution and
    /// auth-header shaping.
    fn kind(&self) -> TransportKind;

    /// Send one JSON-RPC frame.
    async fn send(&self, message: String) -> BrokerResult<()>;

    /// Receive the next inbound frame. `None` means the transport closed.
    async fn recv(&self) -> Option<String>;

    /// Close the transport, releasing its resources.
    async fn close(&self) -> BrokerResult<()>;
}

/// Shared transport handle.
pub type TransportHandle = Arc<dyn McpTransport>;
