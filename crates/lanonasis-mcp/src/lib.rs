//! MCP protocol implementation and client for the Lanonasis broker
//!
//! Speaks JSON-RPC 2.0 framed messages over four transports with identical
//! semantics:
//!
//! - **stdio**: newline-delimited JSON on a child process's stdin/stdout
//! - **WebSocket**: one JSON message per text frame
//! - **HTTP**: one POST per JSON-RPC request
//! - **SSE**: server-push notification channel paired with HTTP requests
//!
//! The client owns the session: `initialize` handshake, tool catalog,
//! monotonic request ids with out-of-order response correlation, and the
//! WebSocket ping keep-alive.

pub mod client;
pub mod protocol;
pub mod transport;

pub use client::{McpClient, McpClientConfig};
pub use protocol::{
    methods, IncomingMessage, InitializeResult, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, ServerInfo, ToolDescriptor, JSONRPC_VERSION,
    MCP_PROTOCOL_VERSION,
};
pub use transport::{McpTransport, TransportHandle};
