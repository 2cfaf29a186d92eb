//! Test doubles: a scripted loopback MCP server (HTTP and WebSocket) and
//! a browser that drives the OAuth redirect itself.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{any, post};
use axum::{Json, Router};
use lanonasis_broker::BrowserOpener;
use lanonasis_core::error::{BrokerError, BrokerResult};
use serde_json::{json, Value};
use url::Url;

/// How the mock MCP endpoint answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpMode {
    /// Initialize/tools/call all succeed.
    Healthy,
    /// Every request is rejected with the token-introspection 401 marker.
    Unauthorized,
}

/// A loopback MCP server speaking just enough JSON-RPC for the broker:
/// `initialize`, `notifications/initialized`, `tools/list`, `tools/call`,
/// `ping`, over HTTP POST and over WebSocket text frames.
pub struct MockMcpServer {
    pub base: String,
    pub ws_base: String,
    pub posts: Arc<AtomicUsize>,
    pub initializes: Arc<AtomicUsize>,
    pub tool_calls: Arc<Mutex<Vec<(String, Value)>>>,
}

struct McpState {
    mode: McpMode,
    posts: Arc<AtomicUsize>,
    initializes: Arc<AtomicUsize>,
    tool_calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockMcpServer {
    pub async fn start(mode: McpMode) -> Self {
        let posts = Arc::new(AtomicUsize::new(0));
        let initializes = Arc::new(AtomicUsize::new(0));
        let tool_calls = Arc::new(Mutex::new(Vec::new()));
        let state = Arc::new(McpState {
            mode,
            posts: posts.clone(),
            initializes: initializes.clone(),
            tool_calls: tool_calls.clone(),
        });

        let app = Router::new()
            .route("/mcp", post(handle_post).get(handle_upgrade))
            .route("/health", any(|| async { Json(json!({"status": "ok"})) }))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{}", addr),
            ws_base: format!("ws://{}/mcp", addr),
            posts,
            initializes,
            tool_calls,
        }
    }
}

/// Shared frame handling. `None` means the frame was a notification and
/// expects no response.
fn respond(state: &McpState, frame: &Value) -> Option<Value> {
    let id = frame.get("id").cloned().filter(|id| !id.is_null())?;
    let method = frame.get("method").and_then(Value::as_str).unwrap_or("");

    let result = match method {
        "initialize" => {
            state.initializes.fetch_add(1, Ordering::SeqCst);
            json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": {"name": "onasis-mcp-mock", "version": "0.0.1"},
                "capabilities": {"tools": {"listChanged": false}},
            })
        }
        "ping" => json!({}),
        "tools/list" => json!({
            "tools": [
                {"name": "memory_list", "inputSchema": {"type": "object"}},
                {"name": "memory_create", "inputSchema": {"type": "object"}},
                {"name": "memory_search", "inputSchema": {"type": "object"}},
            ]
        }),
        "tools/call" => {
            let params = frame.get("params").cloned().unwrap_or(Value::Null);
            let name = params
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
            state.tool_calls.lock().unwrap().push((name, arguments));
            json!({"content": [{"type": "text", "text": "[]"}]})
        }
        _ => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": "method not found"},
            }))
        }
    };

    Some(json!({"jsonrpc": "2.0", "id": id, "result": result}))
}

async fn handle_post(State(state): State<Arc<McpState>>, body: Bytes) -> axum::response::Response {
    state.posts.fetch_add(1, Ordering::SeqCst);

    if state.mode == McpMode::Unauthorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Token introspection failed"})),
        )
            .into_response();
    }

    let frame: Value = match serde_json::from_slice(&body) {
        Ok(frame) => frame,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };

    match respond(&state, &frame) {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn handle_upgrade(
    State(state): State<Arc<McpState>>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    if state.mode == McpMode::Unauthorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Token introspection failed"})),
        )
            .into_response();
    }
    ws.on_upgrade(move |socket| ws_session(socket, state))
}

async fn ws_session(mut socket: WebSocket, state: Arc<McpState>) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };
        if let Some(response) = respond(&state, &frame) {
            if socket
                .send(Message::Text(response.to_string().into()))
                .await
                .is_err()
            {
                break;
            }
        }
    }
}

/// Browser double that immediately follows the authorization redirect by
/// requesting the loopback callback itself.
pub struct RedirectingBrowser {
    /// `code` delivered on the callback.
    pub code: String,
    /// Override for the state sent back; `None` echoes the real one.
    pub state_override: Option<String>,
    pub opened: Mutex<Vec<String>>,
}

impl RedirectingBrowser {
    pub fn new(code: &str) -> Arc<Self> {
        Arc::new(Self {
            code: code.to_string(),
            state_override: None,
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn with_wrong_state(code: &str, state: &str) -> Arc<Self> {
        Arc::new(Self {
            code: code.to_string(),
            state_override: Some(state.to_string()),
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    /// Callback port from the first opened authorization URL.
    pub fn callback_port(&self) -> Option<u16> {
        let opened = self.opened.lock().unwrap();
        let url = Url::parse(opened.first()?).ok()?;
        let redirect = url
            .query_pairs()
            .find(|(k, _)| k == "redirect_uri")
            .map(|(_, v)| v.to_string())?;
        Url::parse(&redirect).ok()?.port()
    }
}

impl BrowserOpener for RedirectingBrowser {
    fn open(&self, url: &str) -> BrokerResult<()> {
        self.opened.lock().unwrap().push(url.to_string());

        let parsed = Url::parse(url).map_err(|e| BrokerError::AuthorizationDenied {
            error: "invalid_authorize_url".to_string(),
            description: Some(e.to_string()),
        })?;
        let param = |name: &str| {
            parsed
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.to_string())
        };
        let redirect = param("redirect_uri").unwrap_or_default();
        let state = self
            .state_override
            .clone()
            .or_else(|| param("state"))
            .unwrap_or_default();
        let callback = format!(
            "{}?code={}&state={}",
            redirect.replace("localhost", "127.0.0.1"),
            self.code,
            state
        );
        tokio::spawn(async move {
            let _ = reqwest::get(callback).await;
        });
        Ok(())
    }
}
