//! Loopback callback listener
//!
//! Single-use server bound exclusively to `127.0.0.1:<port>`. Serves one
//! `GET /callback`, returns a minimal HTML acknowledgement, and shuts
//! down. Every other path is 404. The bind happens before the browser is
//! ever opened: a port conflict is a hard error, not a silent fallback.

use std::sync::Arc;

use axum::extract::{Query, State as AxumState};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use lanonasis_core::defaults;
use lanonasis_core::error::{BrokerError, BrokerResult};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Query parameters delivered on the callback redirect.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

struct ListenerState {
    tx: Mutex<Option<oneshot::Sender<CallbackQuery>>>,
}

/// A bound, single-use callback listener.
///
/// Dropping the listener (on any flow exit path) tears the server down and
/// releases the port.
#[derive(Debug)]
pub struct CallbackListener {
    port: u16,
    rx: oneshot::Receiver<CallbackQuery>,
    // Dropping the sender ends the serve task's graceful-shutdown wait.
    _shutdown_tx: watch::Sender<bool>,
}

impl CallbackListener {
    /// Bind to the loopback port and start serving.
    ///
    /// Address-in-use maps to `PortUnavailable`; any other bind error to
    /// `CallbackBindFailed`. Callers must not open the browser unless this
    /// returns Ok.
    pub async fn bind(port: u16) -> BrokerResult<Self> {
        let listener = match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                warn!("[OAuth] Callback port {} already in use", port);
                return Err(BrokerError::PortUnavailable(port));
            }
            Err(e) => {
                return Err(BrokerError::CallbackBindFailed(e.to_string()));
            }
        };
        let port = listener
            .local_addr()
            .map_err(|e| BrokerError::CallbackBindFailed(e.to_string()))?
            .port();
        info!("[OAuth] Callback listener bound on 127.0.0.1:{}", port);

        let (callback_tx, callback_rx) = oneshot::channel();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let state = Arc::new(ListenerState {
            tx: Mutex::new(Some(callback_tx)),
        });

        let app = Router::new()
            .route(
                defaults::OAUTH_CALLBACK_PATH,
                get(
                    |AxumState(state): AxumState<Arc<ListenerState>>,
                     Query(query): Query<CallbackQuery>| async move {
                        match state.tx.lock().await.take() {
                            Some(tx) => {
                                debug!("[OAuth] Callback received");
                                let _ = tx.send(query);
                            }
                            None => {
                                warn!("[OAuth] Duplicate callback ignored");
                            }
                        }
                        Html(ACK_PAGE)
                    },
                ),
            )
            .fallback(|| async { (StatusCode::NOT_FOUND, "not found") })
            .with_state(state);

        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                // Resolves when the flow signals shutdown or drops the sender.
                let _ = shutdown_rx.changed().await;
                debug!("[OAuth] Callback listener shutting down");
            });
            if let Err(e) = server.await {
                error!("[OAuth] Callback listener error: {}", e);
            }
        });

        Ok(Self {
            port,
            rx: callback_rx,
            _shutdown_tx: shutdown_tx,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Await the single callback. Timing out closes the listener and fails
    /// with `AuthorizationTimeout`; the port is released on every exit
    /// path because `self` is consumed.
    pub async fn wait(self, timeout: std::time::Duration) -> BrokerResult<CallbackQuery> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(query)) => Ok(query),
            Ok(Err(_)) => Err(BrokerError::CallbackBindFailed(
                "callback listener ended unexpectedly".to_string(),
            )),
            Err(_) => {
                warn!("[OAuth] No callback within {:?}", timeout);
                Err(BrokerError::AuthorizationTimeout)
            }
        }
    }
}

/// Minimal acknowledgement page shown in the browser after the redirect.
const ACK_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <title>Lanonasis - Authorization Complete</title>
    <style>
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', sans-serif;
            display: flex;
            align-items: center;
            justify-content: center;
            min-height: 100vh;
            margin: 0;
            background: #101418;
            color: #e6e6e6;
        }
        .box { text-align: center; max-width: 360px; }
        h1 { font-size: 1.4rem; }
        p { color: #9aa4ad; }
    </style>
</head>
<body>
    <div class="box">
        <h1>Authorization complete</h1>
        <p>You can close this window and return to the application.</p>
    </div>
    <script>setTimeout(function(){ window.close(); }, 2000);</script>
</body>
</html>"#;
