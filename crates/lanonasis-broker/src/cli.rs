//! CLI wrapper dispatch
//!
//! Spawns the wrapping CLI with operation subcommands and parses its
//! stdout as the `{data?, error?}` JSON envelope (the Golden Contract the
//! wrapper guarantees). The credential reaches the subprocess through the
//! environment; it never appears in argv.

use std::process::Stdio;

use lanonasis_core::defaults::{self, Timeouts};
use lanonasis_core::domain::AuthMaterial;
use lanonasis_core::error::{BrokerError, BrokerResult, RejectionKind};
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::operations::Operation;

/// Subprocess CLI dispatcher.
pub struct CliDispatcher {
    timeouts: Timeouts,
}

impl CliDispatcher {
    pub fn new(timeouts: Timeouts) -> Self {
        Self { timeouts }
    }

    pub async fn dispatch(
        &self,
        cli_command: &str,
        operation: Operation,
        payload: &Value,
        auth: &AuthMaterial,
    ) -> BrokerResult<Value> {
        let binary = which::which(cli_command).map_err(|_| BrokerError::TransportUnreachable {
            transport: "cli".to_string(),
            message: format!("{} not found on PATH", cli_command),
        })?;
        let args = operation.cli_args(payload)?;
        debug!(operation = %operation, ?args, "[Cli] Spawning wrapper");

        let output = Command::new(&binary)
            .args(&args)
            .env(defaults::ENV_API_KEY, auth.env_value())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeouts.rest, output)
            .await
            .map_err(|_| BrokerError::TransportUnreachable {
                transport: "cli".to_string(),
                message: format!("wrapper did not finish within {:?}", self.timeouts.rest),
            })?
            .map_err(|e| BrokerError::TransportUnreachable {
                transport: "cli".to_string(),
                message: format!("spawn failed: {}", e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let envelope: Value = serde_json::from_str(stdout.trim()).map_err(|_| {
            let stderr = String::from_utf8_lossy(&output.stderr);
            BrokerError::TransportProtocolViolation {
                transport: "cli".to_string(),
                message: format!(
                    "wrapper output is not the JSON envelope (exit {}): {}",
                    output.status,
                    stderr.trim()
                ),
            }
        })?;

        if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if message.to_ascii_lowercase().contains("unauthorized") {
                return Err(BrokerError::TransportAuthRejected {
                    transport: "cli".to_string(),
                    message,
                });
            }
            return Err(BrokerError::OperationRejected {
                kind: RejectionKind::Validation,
                message,
            });
        }

        if !output.status.success() {
            return Err(BrokerError::TransportUnreachable {
                transport: "cli".to_string(),
                message: format!("wrapper exited with {}", output.status),
            });
        }

        Ok(envelope.get("data").cloned().unwrap_or(envelope))
    }
}
