//! Direct REST dispatch
//!
//! Issues one HTTP call per operation against the memory API (or the auth
//! gateway for auth status), shaping the credential into the right header
//! and classifying the response into the broker error taxonomy. The body
//! follows the `{data?, error?}` envelope the CLI wrapper shares.

use std::time::Duration;

use lanonasis_core::defaults::Timeouts;
use lanonasis_core::domain::{AuthMaterial, EndpointSet};
use lanonasis_core::error::{BrokerError, BrokerResult, RejectionKind};
use serde_json::Value;
use tracing::debug;

use crate::operations::Operation;

/// REST-call dispatcher.
pub struct RestDispatcher {
    http: reqwest::Client,
    timeouts: Timeouts,
}

impl RestDispatcher {
    pub fn new(http: reqwest::Client, timeouts: Timeouts) -> Self {
        Self { http, timeouts }
    }

    pub async fn dispatch(
        &self,
        operation: Operation,
        payload: &Value,
        endpoints: &EndpointSet,
        auth: &AuthMaterial,
    ) -> BrokerResult<Value> {
        let route = operation.rest_route(payload)?;
        let base = if operation.targets_auth_base() {
            &endpoints.auth_base
        } else {
            &endpoints.memory_base
        };
        let url = format!("{}{}", base.trim_end_matches('/'), route.path);
        debug!(operation = %operation, method = route.method, url = %url, "[Rest] Dispatching");

        let method: reqwest::Method =
            route
                .method
                .parse()
                .map_err(|_| BrokerError::TransportProtocolViolation {
                    transport: "rest".to_string(),
                    message: format!("invalid method {}", route.method),
                })?;

        let (header, value) = auth.header();
        let mut request = self
            .http
            .request(method, &url)
            .timeout(self.timeouts.rest)
            .header(header, value)
            .header("Accept", "application/json");

        if route.payload_in_body {
            request = request.json(payload);
        } else if let Some(object) = payload.as_object() {
            let query: Vec<(String, String)> = object
                .iter()
                .filter(|(k, _)| *k != "id")
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k.clone(), s.clone())),
                    Value::Number(n) => Some((k.clone(), n.to_string())),
                    Value::Bool(b) => Some((k.clone(), b.to_string())),
                    _ => None,
                })
                .collect();
            if !query.is_empty() {
                request = request.query(&query);
            }
        }

        let response = request.send().await.map_err(|e| {
            let message = if e.is_timeout() {
                "request timed out".to_string()
            } else {
                e.to_string()
            };
            BrokerError::TransportUnreachable {
                transport: "rest".to_string(),
                message,
            }
        })?;

        classify_response(response).await
    }
}

/// Map an HTTP response onto the error taxonomy, or unwrap the envelope.
async fn classify_response(response: reqwest::Response) -> BrokerResult<Value> {
    let status = response.status();

    if status.is_success() {
        let body: Value = response.json().await.unwrap_or(Value::Null);
        // `{data}` envelope unwraps; anything else passes through.
        if let Some(data) = body.get("data") {
            return Ok(data.clone());
        }
        return Ok(body);
    }

    let retry_after = response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let message = extract_error_message(&body).unwrap_or_else(|| body.clone());

    match status.as_u16() {
        401 => Err(BrokerError::TransportAuthRejected {
            transport: "rest".to_string(),
            message: format!("HTTP 401: {}", body),
        }),
        403 => Err(BrokerError::OperationRejected {
            kind: RejectionKind::Forbidden,
            message,
        }),
        404 => Err(BrokerError::OperationRejected {
            kind: RejectionKind::NotFound,
            message,
        }),
        409 => Err(BrokerError::OperationRejected {
            kind: RejectionKind::Conflict,
            message,
        }),
        429 => Err(BrokerError::RateLimited { retry_after }),
        code if (400..500).contains(&code) => Err(BrokerError::OperationRejected {
            kind: RejectionKind::Validation,
            message,
        }),
        _ => Err(BrokerError::TransportUnreachable {
            transport: "rest".to_string(),
            message: format!("HTTP {}", status),
        }),
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .map(|e| match e {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}
