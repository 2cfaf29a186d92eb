//! HTTP and SSE transports
//!
//! Every outbound JSON-RPC message is an HTTP POST. The server may reply
//! with a direct JSON body, an SSE body carrying one or more frames, or
//! `202 Accepted` for notifications. In SSE mode an additional long-lived
//! GET stream carries unsolicited server notifications; requests still go
//! over POST.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lanonasis_core::domain::TransportKind;
use lanonasis_core::error::{BrokerError, BrokerResult};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use super::McpTransport;

/// HTTP-based MCP transport, optionally SSE-augmented.
pub struct HttpTransport {
    kind: TransportKind,
    http_client: reqwest::Client,
    /// POST target for JSON-RPC requests.
    endpoint: String,
    /// GET target for the notification stream (SSE mode only).
    sse_endpoint: Option<String>,
    /// Static headers merged into every request; auth material goes here.
    headers: HashMap<String, String>,
    tx: mpsc::UnboundedSender<String>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
    /// Last SSE event id for `Last-Event-ID` resumption.
    last_event_id: Arc<RwLock<Option<String>>>,
}

impl HttpTransport {
    /// Plain HTTP transport: POST per request, no push channel.
    pub fn new(
        endpoint: impl Into<String>,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> BrokerResult<Self> {
        Self::build(TransportKind::Http, endpoint.into(), None, headers, timeout)
    }

    /// SSE-augmented transport: POSTs paired with a notification stream.
    pub fn new_sse(
        endpoint: impl Into<String>,
        sse_endpoint: impl Into<String>,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> BrokerResult<Self> {
        Self::build(
            TransportKind::Sse,
            endpoint.into(),
            Some(sse_endpoint.into()),
            headers,
            timeout,
        )
    }

    fn build(
        kind: TransportKind,
        endpoint: String,
        sse_endpoint: Option<String>,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> BrokerResult<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::TransportUnreachable {
                transport: kind.to_string(),
                message: format!("http client build failed: {}", e),
            })?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            kind,
            http_client,
            endpoint,
            sse_endpoint,
            headers,
            tx,
            rx: Mutex::new(rx),
            last_event_id: Arc::new(RwLock::new(None)),
        })
    }

    /// Open the long-lived SSE notification stream (SSE mode).
    pub async fn open_notification_stream(&self) -> BrokerResult<()> {
        let Some(sse_endpoint) = &self.sse_endpoint else {
            return Ok(());
        };

        let mut req = self
            .http_client
            .get(sse_endpoint)
            .header("Accept", "text/event-stream");
        {
            let last_id = self.last_event_id.read().await;
            if let Some(id) = last_id.as_deref() {
                req = req.header("Last-Event-ID", id);
            }
        }
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let response = req.send().await.map_err(|e| self.unreachable(e))?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(self.auth_rejected(response).await);
        }
        if !status.is_success() {
            return Err(BrokerError::TransportUnreachable {
                transport: self.kind.to_string(),
                message: format!("SSE stream returned HTTP {}", status),
            });
        }

        let byte_stream = response.bytes_stream();
        let tx = self.tx.clone();
        let last_event_id = Arc::clone(&self.last_event_id);
        tokio::spawn(async move {
            parse_sse_stream(byte_stream, tx, last_event_id).await;
            debug!("[Sse] Notification stream ended");
        });
        Ok(())
    }

    fn unreachable(&self, e: reqwest::Error) -> BrokerError {
        let detail = if e.is_timeout() {
            "timed out".to_string()
        } else if e.is_connect() {
            format!("connection failed: {}", e)
        } else {
            e.to_string()
        };
        BrokerError::TransportUnreachable {
            transport: self.kind.to_string(),
            message: detail,
        }
    }

    async fn auth_rejected(&self, response: reqwest::Response) -> BrokerError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        BrokerError::TransportAuthRejected {
            transport: self.kind.to_string(),
            message: format!("HTTP {}: {}", status.as_u16(), body),
        }
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(&self, message: String) -> BrokerResult<()> {
        let mut req = self
            .http_client
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(message);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        let response = req.send().await.map_err(|e| self.unreachable(e))?;
        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(self.auth_rejected(response).await);
        }
        if status == reqwest::StatusCode::ACCEPTED {
            // Notification acknowledgement; no body expected.
            return Ok(());
        }
        if status.is_server_error() {
            return Err(BrokerError::TransportUnreachable {
                transport: self.kind.to_string(),
                message: format!("HTTP {}", status),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::TransportProtocolViolation {
                transport: self.kind.to_string(),
                message: format!("HTTP {}: {}", status.as_u16(), body),
            });
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            let byte_stream = response.bytes_stream();
            let tx = self.tx.clone();
            let last_event_id = Arc::clone(&self.last_event_id);
            tokio::spawn(async move {
                parse_sse_stream(byte_stream, tx, last_event_id).await;
            });
        } else {
            let body = response.text().await.map_err(|e| self.unreachable(e))?;
            if !body.is_empty() {
                let _ = self.tx.send(body);
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) -> BrokerResult<()> {
        // Request/response transport; dropping the client aborts any
        // in-flight SSE stream task via the closed channel.
        Ok(())
    }
}

/// Parse an SSE byte stream and forward complete `data:` payloads.
///
/// `id:` fields feed the resumption cursor; `event: ping` and `[PING]`
/// data payloads are dropped.
async fn parse_sse_stream(
    byte_stream: impl Stream<Item = reqwest::Result<bytes::Bytes>>,
    tx: mpsc::UnboundedSender<String>,
    last_event_id: Arc<RwLock<Option<String>>>,
) {
    let mut buffer = String::new();
    tokio::pin!(byte_stream);

    while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                warn!("[Sse] Stream error: {}", e);
                break;
            }
        };
        match std::str::from_utf8(&chunk) {
            Ok(text) => buffer.push_str(text),
            Err(_) => continue,
        }

        // Events are separated by blank lines.
        while let Some(pos) = buffer.find("\n\n") {
            let event = buffer[..pos].to_string();
            buffer.drain(..pos + 2);
            process_sse_event(&event, &tx, &last_event_id).await;
        }
    }

    if !buffer.is_empty() {
        process_sse_event(&buffer, &tx, &last_event_id).await;
    }
}

async fn process_sse_event(
    event_block: &str,
    tx: &mpsc::UnboundedSender<String>,
    last_event_id: &Arc<RwLock<Option<String>>>,
) {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event_type: Option<&str> = None;
    let mut event_id: Option<&str> = None;

    for line in event_block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.trim());
        } else if let Some(value) = line.strip_prefix("id:") {
            event_id = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        }
        // `retry:` and `:` comment lines are ignored.
    }

    if let Some(id) = event_id {
        *last_event_id.write().await = Some(id.to_string());
    }

    if matches!(event_type, Some(et) if et.eq_ignore_ascii_case("ping")) {
        return;
    }

    let data = data_lines.join("\n");
    if data.is_empty() || data.eq_ignore_ascii_case("[ping]") {
        return;
    }
    let _ = tx.send(data);
}
