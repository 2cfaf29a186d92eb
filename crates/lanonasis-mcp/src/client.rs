//! MCP client session
//!
//! One session per transport. On open the client sends `initialize`,
//! records the server capabilities, and loads the tool catalog. Request
//! ids are monotonic within the session and responses are correlated by id
//! regardless of arrival order. If the transport fails the session is
//! invalidated; a replacement session is negotiated by the caller.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lanonasis_core::domain::TransportKind;
use lanonasis_core::error::{BrokerError, BrokerResult};
use serde_json::Value;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::protocol::{
    initialize_params, methods, parse_incoming, IncomingMessage, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerInfo, ToolDescriptor,
};
use crate::transport::TransportHandle;

/// Interval between keep-alive pings on WebSocket sessions.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// A session with no successful traffic for this long is invalidated.
const KEEP_ALIVE_DEADLINE: Duration = Duration::from_secs(60);

/// Client construction options.
#[derive(Debug, Clone)]
pub struct McpClientConfig {
    pub client_name: String,
    pub client_version: String,
    /// Per-request timeout (tool calls).
    pub request_timeout: Duration,
    /// Send `ping` keep-alives (WebSocket sessions).
    pub keep_alive: bool,
}

impl Default for McpClientConfig {
    fn default() -> Self {
        Self {
            client_name: "lanonasis-broker".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: Duration::from_secs(60),
            keep_alive: true,
        }
    }
}

/// A negotiated MCP session bound to exactly one transport.
pub struct McpClient {
    transport: TransportHandle,
    config: McpClientConfig,
    next_id: AtomicU64,
    pending: Arc<DashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    tools: RwLock<Vec<ToolDescriptor>>,
    tools_dirty: AtomicBool,
    server_info: RwLock<Option<ServerInfo>>,
    supports_list_changed: AtomicBool,
    invalidated: AtomicBool,
    last_activity: StdMutex<Instant>,
}

impl McpClient {
    /// Negotiate a session: spawn the read loop, run the `initialize`
    /// handshake, and load the tool catalog.
    pub async fn connect(
        transport: TransportHandle,
        config: McpClientConfig,
    ) -> BrokerResult<Arc<Self>> {
        let client = Arc::new(Self {
            transport,
            config,
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            tools: RwLock::new(Vec::new()),
            tools_dirty: AtomicBool::new(false),
            server_info: RwLock::new(None),
            supports_list_changed: AtomicBool::new(false),
            invalidated: AtomicBool::new(false),
            last_activity: StdMutex::new(Instant::now()),
        });

        Self::spawn_read_loop(&client);

        let init_params = initialize_params(&client.config.client_name, &client.config.client_version);
        let raw = client
            .request(methods::INITIALIZE, Some(init_params))
            .await?;
        let init: InitializeResult =
            serde_json::from_value(raw).map_err(|e| BrokerError::TransportProtocolViolation {
                transport: client.kind().to_string(),
                message: format!("malformed initialize result: {}", e),
            })?;

        info!(
            server = %init.server_info.name,
            version = %init.server_info.version,
            transport = %client.kind(),
            "[Mcp] Session negotiated"
        );
        client
            .supports_list_changed
            .store(init.supports_tools_list_changed(), Ordering::SeqCst);
        *client.server_info.write().await = Some(init.server_info);

        client
            .notify(methods::NOTIF_INITIALIZED, None)
            .await?;
        client.refresh_tools().await?;

        if client.config.keep_alive && client.kind() == TransportKind::Ws {
            Self::spawn_keep_alive(&client);
        }

        Ok(client)
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Whether the session has been invalidated by disconnect or a missed
    /// keep-alive deadline.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.read().await.clone()
    }

    /// Whether the server advertises `tools/list_changed` notifications.
    pub fn supports_tools_list_changed(&self) -> bool {
        self.supports_list_changed.load(Ordering::SeqCst)
    }

    /// The tool catalog, refreshed first when a `tools/list_changed`
    /// notification arrived since the last read.
    pub async fn tools(&self) -> BrokerResult<Vec<ToolDescriptor>> {
        if self.tools_dirty.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.refresh_tools().await {
                self.tools_dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(self.tools.read().await.clone())
    }

    /// Issue one JSON-RPC request and await its correlated response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> BrokerResult<Value> {
        if self.is_invalidated() {
            return Err(BrokerError::TransportUnreachable {
                transport: self.kind().to_string(),
                message: "session invalidated".to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let frame = JsonRpcRequest::new(id, method, params);
        let raw = serde_json::to_string(&frame).map_err(|e| {
            BrokerError::TransportProtocolViolation {
                transport: self.kind().to_string(),
                message: format!("request serialization failed: {}", e),
            }
        })?;

        if let Err(e) = self.transport.send(raw).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => response.into_result(self.kind().as_str()),
            Ok(Err(_)) => Err(BrokerError::TransportUnreachable {
                transport: self.kind().to_string(),
                message: "connection closed before response".to_string(),
            }),
            Err(_) => {
                self.pending.remove(&id);
                Err(BrokerError::TransportUnreachable {
                    transport: self.kind().to_string(),
                    message: format!(
                        "no response to {} within {:?}",
                        method, self.config.request_timeout
                    ),
                })
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> BrokerResult<()> {
        let frame = JsonRpcNotification::new(method, params);
        let raw = serde_json::to_string(&frame).map_err(|e| {
            BrokerError::TransportProtocolViolation {
                transport: self.kind().to_string(),
                message: format!("notification serialization failed: {}", e),
            }
        })?;
        self.transport.send(raw).await
    }

    /// Invoke a tool. The result is returned without interpretation;
    /// argument schema validation is the caller's responsibility.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> BrokerResult<Value> {
        debug!(tool = %name, transport = %self.kind(), "[Mcp] Calling tool");
        self.request(
            methods::TOOLS_CALL,
            Some(serde_json::json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    /// Liveness probe.
    pub async fn ping(&self) -> BrokerResult<()> {
        self.request(methods::PING, None).await.map(|_| ())
    }

    /// Re-fetch the tool catalog.
    pub async fn refresh_tools(&self) -> BrokerResult<Vec<ToolDescriptor>> {
        let raw = self.request(methods::TOOLS_LIST, None).await?;
        let tools: Vec<ToolDescriptor> = raw
            .get("tools")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| BrokerError::TransportProtocolViolation {
                transport: self.kind().to_string(),
                message: format!("malformed tools/list result: {}", e),
            })?
            .unwrap_or_default();
        debug!(count = tools.len(), "[Mcp] Tool catalog refreshed");
        *self.tools.write().await = tools.clone();
        Ok(tools)
    }

    /// Invalidate the session and close the transport. Pending calls fail
    /// with a connection-closed error.
    pub async fn close(&self) -> BrokerResult<()> {
        self.invalidated.store(true, Ordering::SeqCst);
        self.pending.clear();
        self.transport.close().await
    }

    fn touch(&self) {
        if let Ok(mut guard) = self.last_activity.lock() {
            *guard = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|guard| guard.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    fn handle_frame(&self, raw: &str) {
        match parse_incoming(self.kind().as_str(), raw) {
            Ok(IncomingMessage::Response(response)) => {
                self.touch();
                match self.pending.remove(&response.id) {
                    Some((_, tx)) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(id = response.id, "[Mcp] Response for unknown id dropped"),
                }
            }
            Ok(IncomingMessage::Notification(n))
                if n.method == methods::NOTIF_TOOLS_LIST_CHANGED =>
            {
                debug!("[Mcp] Tool catalog changed; will refresh on next read");
                self.tools_dirty.store(true, Ordering::SeqCst);
            }
            Ok(IncomingMessage::Notification(n)) => {
                debug!(method = %n.method, "[Mcp] Ignoring notification");
            }
            Err(e) => warn!("[Mcp] Dropping malformed frame: {}", e),
        }
    }

    fn handle_disconnect(&self) {
        if !self.invalidated.swap(true, Ordering::SeqCst) {
            info!(transport = %self.kind(), "[Mcp] Transport closed; session invalidated");
        }
        // Dropping the senders wakes every awaiting caller with an error.
        self.pending.clear();
    }

    fn spawn_read_loop(client: &Arc<Self>) {
        let transport = client.transport.clone();
        let weak = Arc::downgrade(client);
        tokio::spawn(async move {
            loop {
                match transport.recv().await {
                    Some(frame) => {
                        let Some(client) = weak.upgrade() else { break };
                        client.handle_frame(&frame);
                    }
                    None => {
                        if let Some(client) = weak.upgrade() {
                            client.handle_disconnect();
                        }
                        break;
                    }
                }
            }
        });
    }

    fn spawn_keep_alive(client: &Arc<Self>) {
        let weak = Arc::downgrade(client);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEP_ALIVE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(client) = weak.upgrade() else { break };
                if client.is_invalidated() {
                    break;
                }
                if let Err(e) = client.ping().await {
                    warn!("[Mcp] Keep-alive ping failed: {}", e);
                }
                if client.idle_for() > KEEP_ALIVE_DEADLINE {
                    warn!("[Mcp] No traffic for {:?}; invalidating session", KEEP_ALIVE_DEADLINE);
                    let _ = client.close().await;
                    break;
                }
            }
        });
    }
}
