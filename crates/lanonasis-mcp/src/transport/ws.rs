//! WebSocket transport
//!
//! One JSON-RPC message per text frame. Reconnection uses exponential
//! backoff capped at 30 s; the client re-negotiates the session after each
//! reconnect because request ids and the tool catalog do not survive the
//! socket.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use lanonasis_core::domain::TransportKind;
use lanonasis_core::error::{BrokerError, BrokerResult};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::McpTransport;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Reconnect backoff: 1 s, 2 s, 4 s, … capped at 30 s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX).min(30);
    Duration::from_secs(secs)
}

/// A connected WebSocket MCP transport.
#[derive(Debug)]
pub struct WsTransport {
    sink: Mutex<Option<WsSink>>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl WsTransport {
    /// Perform the handshake and start the read loop.
    ///
    /// Auth material goes into the handshake headers; the server never sees
    /// it again on this connection.
    pub async fn connect(
        url: &str,
        headers: &[(String, String)],
        handshake_timeout: Duration,
    ) -> BrokerResult<Self> {
        let mut request =
            url.into_client_request()
                .map_err(|e| BrokerError::TransportUnreachable {
                    transport: "ws".to_string(),
                    message: format!("invalid websocket url {}: {}", url, e),
                })?;
        for (name, value) in headers {
            use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                BrokerError::TransportUnreachable {
                    transport: "ws".to_string(),
                    message: format!("invalid header name {}", name),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                BrokerError::TransportUnreachable {
                    transport: "ws".to_string(),
                    message: "invalid header value".to_string(),
                }
            })?;
            request.headers_mut().insert(name, value);
        }

        let connect = connect_async(request);
        let (stream, _response) = tokio::time::timeout(handshake_timeout, connect)
            .await
            .map_err(|_| BrokerError::TransportUnreachable {
                transport: "ws".to_string(),
                message: format!("handshake timed out after {:?}", handshake_timeout),
            })?
            .map_err(classify_handshake_error)?;

        debug!(url = %url, "[Ws] Connected");

        let (sink, mut source) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("[Ws] Server closed: {:?}", frame);
                        break;
                    }
                    // Pings are answered by the protocol layer on flush.
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[Ws] Read error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            sink: Mutex::new(Some(sink)),
            rx: Mutex::new(rx),
        })
    }
}

fn classify_handshake_error(e: WsError) -> BrokerError {
    match e {
        WsError::Http(response) if response.status().as_u16() == 401 => {
            BrokerError::TransportAuthRejected {
                transport: "ws".to_string(),
                message: format!("handshake rejected: HTTP {}", response.status()),
            }
        }
        other => BrokerError::TransportUnreachable {
            transport: "ws".to_string(),
            message: format!("handshake failed: {}", other),
        },
    }
}

#[async_trait]
impl McpTransport for WsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ws
    }

    async fn send(&self, message: String) -> BrokerResult<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| BrokerError::TransportUnreachable {
                transport: "ws".to_string(),
                message: "transport closed".to_string(),
            })?;
        sink.send(Message::Text(message))
            .await
            .map_err(|e| BrokerError::TransportUnreachable {
                transport: "ws".to_string(),
                message: format!("send failed: {}", e),
            })
    }

    async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) -> BrokerResult<()> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                debug!("[Ws] Close frame not delivered: {}", e);
            }
        }
        Ok(())
    }
}
