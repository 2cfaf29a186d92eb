//! JSON-RPC 2.0 frames and the MCP subset the broker depends on
//!
//! Mandatory methods: `initialize`, `tools/list`, `tools/call`, `ping`.
//! Optional notification: `notifications/tools/list_changed`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lanonasis_core::error::{BrokerError, BrokerResult};

/// JSON-RPC version string on every frame.
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision sent in `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Method names.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const PING: &str = "ping";
    pub const NOTIF_INITIALIZED: &str = "notifications/initialized";
    pub const NOTIF_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
}

/// An outbound request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// An outbound or inbound notification frame (no id, no response).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// Error object inside a response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An inbound response frame, correlated by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Unwrap the result, mapping a JSON-RPC error object to the broker
    /// taxonomy.
    pub fn into_result(self, transport: &str) -> BrokerResult<Value> {
        if let Some(error) = self.error {
            return Err(BrokerError::TransportProtocolViolation {
                transport: transport.to_string(),
                message: format!("JSON-RPC error {}: {}", error.code, error.message),
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// A parsed inbound frame.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// Parse one inbound frame. Frames with an `id` are responses; frames with
/// a `method` and no `id` are notifications. Anything else violates the
/// protocol.
pub fn parse_incoming(transport: &str, raw: &str) -> BrokerResult<IncomingMessage> {
    let value: Value = serde_json::from_str(raw).map_err(|e| {
        BrokerError::TransportProtocolViolation {
            transport: transport.to_string(),
            message: format!("frame is not JSON: {}", e),
        }
    })?;

    if value.get("id").map(|id| !id.is_null()).unwrap_or(false)
        && (value.get("result").is_some() || value.get("error").is_some())
    {
        let response: JsonRpcResponse =
            serde_json::from_value(value).map_err(|e| BrokerError::TransportProtocolViolation {
                transport: transport.to_string(),
                message: format!("malformed response frame: {}", e),
            })?;
        return Ok(IncomingMessage::Response(response));
    }

    if value.get("method").is_some() {
        let notification: JsonRpcNotification =
            serde_json::from_value(value).map_err(|e| BrokerError::TransportProtocolViolation {
                transport: transport.to_string(),
                message: format!("malformed notification frame: {}", e),
            })?;
        return Ok(IncomingMessage::Notification(notification));
    }

    Err(BrokerError::TransportProtocolViolation {
        transport: transport.to_string(),
        message: "frame is neither response nor notification".to_string(),
    })
}

/// A tool advertised by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared JSON schema for the arguments. Validation is the caller's
    /// responsibility.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// Server identity from the `initialize` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Parsed `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: String,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
    #[serde(default)]
    pub capabilities: Value,
}

impl InitializeResult {
    /// Whether the server emits `notifications/tools/list_changed`.
    pub fn supports_tools_list_changed(&self) -> bool {
        self.capabilities
            .get("tools")
            .and_then(|t| t.get("listChanged"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Client half of the `initialize` handshake.
pub fn initialize_params(client_name: &str, client_version: &str) -> Value {
    serde_json::json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": client_name,
            "version": client_version,
        },
    })
}
