//! Router integration: fallback chains and auth escalation across real
//! loopback transports.

use lanonasis_core::domain::TransportState;
use lanonasis_core::error::BrokerError;
use pretty_assertions::assert_eq;
use tests::{endpoints, BrokerHarness, McpMode, MockMcpServer, RedirectingBrowser};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[cfg(unix)]
fn marker_cli(dir: &std::path::Path) -> (String, std::path::PathBuf) {
    use std::os::unix::fs::PermissionsExt;
    let marker = dir.join("cli-was-invoked");
    let script = dir.join("onasis-cli");
    std::fs::write(
        &script,
        format!("#!/bin/sh\ntouch {}\necho '{{\"data\": []}}'\n", marker.display()),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    (script.to_string_lossy().to_string(), marker)
}

#[cfg(unix)]
#[tokio::test]
async fn transport_fallback_stops_at_first_success() {
    let mcp = MockMcpServer::start(McpMode::Healthy).await;
    let dir = tempfile::tempdir().unwrap();
    let (cli_command, marker) = marker_cli(dir.path());

    // ws is dead, sse 404s on its stream, http MCP answers.
    let harness = BrokerHarness::new(
        endpoints(&mcp.base, "ws://127.0.0.1:9/mcp"),
        RedirectingBrowser::new("unused"),
        |config| {
            config.transport_preferences.cli_command = Some(cli_command);
        },
    )
    .await;
    harness.seed_valid_oauth("AT1", None).await;

    let result = harness
        .broker
        .dispatch(
            lanonasis_broker::Operation::ListMemories,
            serde_json::json!({}),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(result.get("content").is_some(), "tool result passes through");

    // The call went through the MCP http transport.
    let calls = mcp.tool_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "memory_list");

    // ws left ready ordering after its hard failure.
    let ws = harness
        .broker
        .transport_registry()
        .descriptors()
        .into_iter()
        .find(|d| d.id == "ws")
        .unwrap();
    assert_eq!(ws.state, TransportState::Degraded);

    // No retry ever reached the CLI wrapper.
    assert!(!marker.exists(), "cli must not be invoked after a success");
}

#[tokio::test]
async fn second_401_with_introspection_marker_requires_reauthentication() {
    let mcp = MockMcpServer::start(McpMode::Unauthorized).await;
    let auth_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "AT2",
            "expires_in": 3600,
        })))
        // invalidate() after the first 401 triggers exactly one refresh.
        .expect(1)
        .mount(&auth_server)
        .await;

    // The MCP endpoint lives on the mock; the auth base on wiremock.
    let mut endpoint_set = endpoints(&mcp.base, "ws://127.0.0.1:9/mcp");
    endpoint_set.auth_base = auth_server.uri();

    let harness = BrokerHarness::new(
        endpoint_set,
        RedirectingBrowser::new("unused"),
        |_| {},
    )
    .await;
    harness.seed_valid_oauth("AT1", Some("RT1")).await;

    let err = harness
        .broker
        .dispatch(
            lanonasis_broker::Operation::ListMemories,
            serde_json::json!({}),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    // Second 401 on the same transport escalates to reauthentication;
    // remaining transports are NOT attempted (that would have produced
    // NoTransportAvailable instead).
    assert!(matches!(err, BrokerError::ReauthenticationRequired));

    // Same candidate retried exactly once: two POSTs hit the endpoint.
    assert_eq!(mcp.posts.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn read_exhaustion_carries_per_candidate_outcomes() {
    // Everything is dead.
    let harness = BrokerHarness::new(
        endpoints("http://127.0.0.1:9", "ws://127.0.0.1:9/mcp"),
        RedirectingBrowser::new("unused"),
        |_| {},
    )
    .await;
    harness.seed_valid_oauth("AT1", None).await;

    let err = harness
        .broker
        .dispatch(
            lanonasis_broker::Operation::ListMemories,
            serde_json::json!({}),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        BrokerError::NoTransportAvailable { attempts } => {
            let ids: Vec<&str> = attempts.iter().map(|a| a.transport_id.as_str()).collect();
            assert!(ids.contains(&"ws"));
            assert!(ids.contains(&"http"));
            assert!(ids.contains(&"rest"));
        }
        other => panic!("expected NoTransportAvailable, got {}", other),
    }
}

#[tokio::test]
async fn create_memory_travels_over_websocket() {
    let mcp = MockMcpServer::start(McpMode::Healthy).await;
    // The WS transport is ranked first when authenticated; a mutation
    // must go out exactly once, on that first candidate.
    let harness = BrokerHarness::new(
        endpoints(&mcp.base, &mcp.ws_base),
        RedirectingBrowser::new("unused"),
        |_| {},
    )
    .await;
    harness.seed_valid_oauth("AT1", None).await;

    harness
        .broker
        .dispatch(
            lanonasis_broker::Operation::CreateMemory,
            serde_json::json!({"title": "Standup notes", "content": "Shipped the broker"}),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let calls = mcp.tool_calls.lock().unwrap().clone();
    let (name, arguments) = &calls[0];
    assert_eq!(name, "memory_create");
    assert_eq!(arguments["title"], "Standup notes");
    assert_eq!(calls.len(), 1, "exactly one successful dispatch");
}

#[tokio::test]
async fn mutation_does_not_cross_transports_on_transient_failure() {
    // ws (ranked first) is dead; the create must surface immediately
    // rather than walk the fallback chain, because partial success is
    // unknowable for mutations.
    let mcp = MockMcpServer::start(McpMode::Healthy).await;
    let harness = BrokerHarness::new(
        endpoints(&mcp.base, "ws://127.0.0.1:9/mcp"),
        RedirectingBrowser::new("unused"),
        |_| {},
    )
    .await;
    harness.seed_valid_oauth("AT1", None).await;

    let err = harness
        .broker
        .dispatch(
            lanonasis_broker::Operation::CreateMemory,
            serde_json::json!({"title": "t", "content": "c"}),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::TransportUnreachable { .. }));
    assert!(mcp.tool_calls.lock().unwrap().is_empty(), "no dispatch happened");
}

#[tokio::test]
async fn list_tools_resolves_via_mcp_session() {
    let mcp = MockMcpServer::start(McpMode::Healthy).await;
    let harness = BrokerHarness::new(
        endpoints(&mcp.base, "ws://127.0.0.1:9/mcp"),
        RedirectingBrowser::new("unused"),
        |_| {},
    )
    .await;
    harness.seed_valid_oauth("AT1", None).await;

    let tools = harness
        .broker
        .dispatch(
            lanonasis_broker::Operation::ListTools,
            serde_json::json!({}),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let names: Vec<&str> = tools
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert!(names.contains(&"memory_list"));
    assert!(names.contains(&"memory_create"));
}

#[tokio::test]
async fn session_is_reused_across_dispatches() {
    let mcp = MockMcpServer::start(McpMode::Healthy).await;
    let harness = BrokerHarness::new(
        endpoints(&mcp.base, "ws://127.0.0.1:9/mcp"),
        RedirectingBrowser::new("unused"),
        |_| {},
    )
    .await;
    harness.seed_valid_oauth("AT1", None).await;

    for _ in 0..2 {
        harness
            .broker
            .dispatch(
                lanonasis_broker::Operation::Search,
                serde_json::json!({"query": "standup"}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    // One initialize handshake serves both dispatches.
    assert_eq!(mcp.initializes.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(mcp.tool_calls.lock().unwrap().len(), 2);
}
