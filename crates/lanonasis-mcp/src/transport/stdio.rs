//! Stdio transport - local MCP server as a child process
//!
//! Newline-delimited JSON on the child's stdin/stdout. Stderr is log
//! output and is never parsed. The credential reaches the child through
//! its environment at spawn; it is never written to the stream.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use lanonasis_core::domain::TransportKind;
use lanonasis_core::error::{BrokerError, BrokerResult};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::McpTransport;

/// Grace period between SIGTERM and SIGKILL on teardown.
const TERM_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// A spawned stdio MCP server.
#[derive(Debug)]
pub struct StdioTransport {
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl StdioTransport {
    /// Spawn the child and wire up its pipes.
    ///
    /// The command string may carry embedded arguments ("npx -y
    /// @onasis/mcp-server"); it is split with shell quoting rules.
    pub async fn spawn(command: &str, env: &HashMap<String, String>) -> BrokerResult<Self> {
        let parts = shell_words::split(command).map_err(|e| BrokerError::TransportUnreachable {
            transport: "stdio".to_string(),
            message: format!("cannot parse command {:?}: {}", command, e),
        })?;
        let (executable, args) = match parts.split_first() {
            Some((exe, rest)) => (exe.clone(), rest.to_vec()),
            None => {
                return Err(BrokerError::TransportUnreachable {
                    transport: "stdio".to_string(),
                    message: "empty command".to_string(),
                })
            }
        };

        info!(
            executable = %executable,
            args = ?args,
            "[Stdio] Spawning MCP server"
        );

        let mut cmd = Command::new(&executable);
        cmd.args(&args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // New process group so terminal signals to the host don't propagate
        // to the MCP server child.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| BrokerError::TransportUnreachable {
            transport: "stdio".to_string(),
            message: format!("spawn {} failed: {}", executable, e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| BrokerError::TransportUnreachable {
            transport: "stdio".to_string(),
            message: "child stdin unavailable".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| BrokerError::TransportUnreachable {
            transport: "stdio".to_string(),
            message: "child stdout unavailable".to_string(),
        })?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::unbounded_channel();

        // Reader: one frame per line.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if tx.send(line).is_err() {
                    break;
                }
            }
            debug!("[Stdio] stdout closed");
        });

        // Stderr is diagnostic log, surfaced but never parsed.
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[Stdio] server: {}", line);
                }
            });
        }

        Ok(Self {
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            rx: Mutex::new(rx),
        })
    }

    /// SIGTERM the child, then SIGKILL after the grace period.
    async fn terminate(child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: pid came from a live child we own.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!("[Stdio] Child exited after SIGTERM: {}", status);
                    return;
                }
                Ok(Err(e)) => warn!("[Stdio] wait failed: {}", e),
                Err(_) => warn!("[Stdio] Child ignored SIGTERM; killing"),
            }
        }
        if let Err(e) = child.kill().await {
            warn!("[Stdio] kill failed: {}", e);
        }
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn send(&self, message: String) -> BrokerResult<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| BrokerError::TransportUnreachable {
            transport: "stdio".to_string(),
            message: "transport closed".to_string(),
        })?;
        let framed = format!("{}\n", message);
        let write = async {
            stdin.write_all(framed.as_bytes()).await?;
            stdin.flush().await
        };
        write.await.map_err(|e| BrokerError::TransportUnreachable {
            transport: "stdio".to_string(),
            message: format!("write to child failed: {}", e),
        })
    }

    async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) -> BrokerResult<()> {
        // Dropping stdin sends EOF first; well-behaved servers exit on it.
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            Self::terminate(&mut child).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_splitting_rejects_empty() {
        let err = StdioTransport::spawn("", &HashMap::new()).await;
        assert!(err.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_round_trip_through_cat() {
        // `cat` echoes stdin to stdout, which is exactly a line-framed echo
        // server.
        let transport = StdioTransport::spawn("cat", &HashMap::new()).await.unwrap();
        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#.to_string())
            .await
            .unwrap();
        let frame = tokio::time::timeout(std::time::Duration::from_secs(5), transport.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
        transport.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_missing_binary_is_unreachable() {
        let err = StdioTransport::spawn("definitely-not-a-real-binary-xyz", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::TransportUnreachable { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_recv_returns_none_after_child_exit() {
        let transport = StdioTransport::spawn("true", &HashMap::new()).await.unwrap();
        let frame = tokio::time::timeout(std::time::Duration::from_secs(5), transport.recv())
            .await
            .unwrap();
        assert!(frame.is_none());
        transport.close().await.unwrap();
    }
}
