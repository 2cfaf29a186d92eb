//! The supported MaaS operations
//!
//! One enum names every action the router can dispatch; each carries its
//! idempotency class, its MCP tool name, its REST route, and its CLI
//! wrapper argv. Centralizing the mapping keeps the transports free of
//! per-operation branching.

use lanonasis_core::error::{BrokerError, RejectionKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A routable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    ListMemories,
    GetMemory,
    CreateMemory,
    UpdateMemory,
    DeleteMemory,
    Search,
    GetAuthStatus,
    ListTools,
}

/// A REST route for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestRoute {
    pub method: &'static str,
    /// Path under the memory base (auth status goes to the auth base).
    pub path: String,
    /// Whether the payload travels as the JSON body (otherwise as query
    /// parameters).
    pub payload_in_body: bool,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListMemories => "listMemories",
            Self::GetMemory => "getMemory",
            Self::CreateMemory => "createMemory",
            Self::UpdateMemory => "updateMemory",
            Self::DeleteMemory => "deleteMemory",
            Self::Search => "search",
            Self::GetAuthStatus => "getAuthStatus",
            Self::ListTools => "listTools",
        }
    }

    /// Read-only operations may be retried freely across transports;
    /// mutations may not, because partial success is unknowable.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::ListMemories | Self::GetMemory | Self::Search | Self::GetAuthStatus | Self::ListTools
        )
    }

    /// MCP tool this operation maps to. `ListTools` uses the protocol's
    /// own `tools/list` instead of a tool.
    pub fn tool_name(&self) -> Option<&'static str> {
        match self {
            Self::ListMemories => Some("memory_list"),
            Self::GetMemory => Some("memory_get"),
            Self::CreateMemory => Some("memory_create"),
            Self::UpdateMemory => Some("memory_update"),
            Self::DeleteMemory => Some("memory_delete"),
            Self::Search => Some("memory_search"),
            Self::GetAuthStatus => Some("auth_status"),
            Self::ListTools => None,
        }
    }

    /// Whether the operation targets the auth gateway rather than the
    /// memory API.
    pub fn targets_auth_base(&self) -> bool {
        matches!(self, Self::GetAuthStatus)
    }

    /// REST route; the `{id}` operations require an `id` field in the
    /// payload.
    pub fn rest_route(&self, payload: &Value) -> Result<RestRoute, BrokerError> {
        let route = match self {
            Self::ListMemories => RestRoute {
                method: "GET",
                path: "/api/v1/memory".to_string(),
                payload_in_body: false,
            },
            Self::GetMemory => RestRoute {
                method: "GET",
                path: format!("/api/v1/memory/{}", require_id(self, payload)?),
                payload_in_body: false,
            },
            Self::CreateMemory => RestRoute {
                method: "POST",
                path: "/api/v1/memory".to_string(),
                payload_in_body: true,
            },
            Self::UpdateMemory => RestRoute {
                method: "PUT",
                path: format!("/api/v1/memory/{}", require_id(self, payload)?),
                payload_in_body: true,
            },
            Self::DeleteMemory => RestRoute {
                method: "DELETE",
                path: format!("/api/v1/memory/{}", require_id(self, payload)?),
                payload_in_body: false,
            },
            Self::Search => RestRoute {
                method: "POST",
                path: "/api/v1/memory/search".to_string(),
                payload_in_body: true,
            },
            Self::GetAuthStatus => RestRoute {
                method: "GET",
                path: "/api/v1/auth/status".to_string(),
                payload_in_body: false,
            },
            Self::ListTools => {
                return Err(BrokerError::OperationRejected {
                    kind: RejectionKind::Validation,
                    message: "listTools has no REST route".to_string(),
                })
            }
        };
        Ok(route)
    }

    /// CLI wrapper argv, always ending in `--output json` per the CLI's
    /// stable output contract.
    pub fn cli_args(&self, payload: &Value) -> Result<Vec<String>, BrokerError> {
        let mut args: Vec<String> = match self {
            Self::ListMemories => vec!["memory".into(), "list".into()],
            Self::GetMemory => vec![
                "memory".into(),
                "get".into(),
                "--id".into(),
                require_id(self, payload)?,
            ],
            Self::CreateMemory => {
                let mut args = vec!["memory".into(), "create".into()];
                args.extend(payload_flags(payload));
                args
            }
            Self::UpdateMemory => {
                let mut args = vec![
                    "memory".into(),
                    "update".into(),
                    "--id".into(),
                    require_id(self, payload)?,
                ];
                args.extend(payload_flags_except(payload, &["id"]));
                args
            }
            Self::DeleteMemory => vec![
                "memory".into(),
                "delete".into(),
                "--id".into(),
                require_id(self, payload)?,
            ],
            Self::Search => {
                let query = payload
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or_else(|| BrokerError::OperationRejected {
                        kind: RejectionKind::Validation,
                        message: "search requires a query field".to_string(),
                    })?;
                vec![
                    "memory".into(),
                    "search".into(),
                    "--query".into(),
                    query.to_string(),
                ]
            }
            Self::GetAuthStatus => vec!["auth".into(), "status".into()],
            Self::ListTools => {
                return Err(BrokerError::OperationRejected {
                    kind: RejectionKind::Validation,
                    message: "listTools is not routable via the CLI".to_string(),
                })
            }
        };
        args.push("--output".into());
        args.push("json".into());
        Ok(args)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn require_id(op: &Operation, payload: &Value) -> Result<String, BrokerError> {
    payload
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| BrokerError::OperationRejected {
            kind: RejectionKind::Validation,
            message: format!("{} requires an id field", op.name()),
        })
}

/// Turn scalar payload fields into `--flag value` pairs (camelCase keys
/// become kebab-case flags).
fn payload_flags(payload: &Value) -> Vec<String> {
    payload_flags_except(payload, &[])
}

fn payload_flags_except(payload: &Value, skip: &[&str]) -> Vec<String> {
    let Some(object) = payload.as_object() else {
        return Vec::new();
    };
    let mut flags = Vec::new();
    for (key, value) in object {
        if skip.contains(&key.as_str()) {
            continue;
        }
        let rendered = match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        flags.push(format!("--{}", kebab_case(key)));
        flags.push(rendered);
    }
    flags
}

fn kebab_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 2);
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('-');
            out.push(c.to_ascii_lowercase());
        } else if c == '_' {
            out.push('-');
        } else {
            out.push(c);
        }
    }
    out
}
