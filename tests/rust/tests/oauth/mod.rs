//! OAuth flow integration: the PKCE dance against a mocked auth gateway.

use lanonasis_core::domain::{AuthMaterial, Credential};
use lanonasis_core::error::BrokerError;
use pretty_assertions::assert_eq;
use tests::{endpoints, scopes, BrokerHarness, RedirectingBrowser};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn token_endpoint(server: &MockServer, response: ResponseTemplate, expected_hits: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(response)
        .expect(expected_hits)
        .mount(server)
        .await;
}

#[tokio::test]
async fn happy_oauth_persists_token_and_releases_port() {
    let auth_server = MockServer::start().await;
    token_endpoint(
        &auth_server,
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "AT1",
            "refresh_token": "RT1",
            "expires_in": 3600,
        })),
        1,
    )
    .await;

    let browser = RedirectingBrowser::new("abc");
    let harness = BrokerHarness::new(
        endpoints(&auth_server.uri(), "ws://127.0.0.1:9/mcp"),
        browser.clone(),
        |config| {
            // Ephemeral callback port keeps the test independent of 8080.
            config.transport_preferences.callback_port = Some(0);
        },
    )
    .await;

    harness
        .broker
        .sign_in(scopes(&["memories:read"]), &CancellationToken::new())
        .await
        .unwrap();

    // Stored credential is the structured oauth record.
    let credential = harness.broker.credential_store().get().await.unwrap().unwrap();
    match &credential {
        Credential::Oauth { refresh_token, .. } => {
            assert_eq!(refresh_token.as_deref(), Some("RT1"));
        }
        other => panic!("expected oauth credential, got {:?}", other),
    }

    // authorize -> persist -> acquire yields the same access token.
    match harness.broker.acquire_auth().await.unwrap() {
        AuthMaterial::Bearer(token) => assert_eq!(token, "AT1"),
        other => panic!("expected Bearer, got {:?}", other),
    }

    // The callback port is released after the flow.
    let port = browser.callback_port().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    assert!(
        tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok(),
        "callback port {} must be rebindable",
        port
    );

    // Exactly one redemption, with PKCE material attached.
    let requests = auth_server.received_requests().await.unwrap();
    let body = String::from_utf8_lossy(&requests[0].body).to_string();
    assert!(body.contains("code=abc"));
    assert!(body.contains("code_verifier="));
    assert!(body.contains("client_id=test-client"));
}

#[tokio::test]
async fn port_in_use_fails_before_browser_opens() {
    let auth_server = MockServer::start().await;
    token_endpoint(&auth_server, ResponseTemplate::new(200), 0).await;

    let holder = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let taken_port = holder.local_addr().unwrap().port();

    let browser = RedirectingBrowser::new("abc");
    let harness = BrokerHarness::new(
        endpoints(&auth_server.uri(), "ws://127.0.0.1:9/mcp"),
        browser.clone(),
        |config| {
            config.transport_preferences.callback_port = Some(taken_port);
        },
    )
    .await;

    let err = harness
        .broker
        .sign_in(scopes(&["memories:read"]), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::PortUnavailable(p) if p == taken_port));
    assert_eq!(browser.open_count(), 0, "browser must not be opened");
    assert!(
        harness.broker.credential_store().get().await.unwrap().is_none(),
        "config must be unchanged"
    );
}

#[tokio::test]
async fn state_mismatch_discards_code_without_redemption() {
    let auth_server = MockServer::start().await;
    // expect(0): the token endpoint must never be called.
    token_endpoint(&auth_server, ResponseTemplate::new(200), 0).await;

    let browser =
        RedirectingBrowser::with_wrong_state("abc", "00000000000000000000000000000000");
    let harness = BrokerHarness::new(
        endpoints(&auth_server.uri(), "ws://127.0.0.1:9/mcp"),
        browser.clone(),
        |config| {
            config.transport_preferences.callback_port = Some(0);
        },
    )
    .await;

    let err = harness
        .broker
        .sign_in(scopes(&["memories:read"]), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::StateMismatch));

    assert!(
        harness.broker.credential_store().get().await.unwrap().is_none(),
        "no credential may be written"
    );

    // Port released on the failure path too.
    let port = browser.callback_port().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    assert!(tokio::net::TcpListener::bind(("127.0.0.1", port)).await.is_ok());
}

#[tokio::test]
async fn malformed_state_shape_is_rejected() {
    let auth_server = MockServer::start().await;
    token_endpoint(&auth_server, ResponseTemplate::new(200), 0).await;

    // 31 hex chars: wrong length, even though it would otherwise look hex.
    let browser = RedirectingBrowser::with_wrong_state("abc", "0000000000000000000000000000000");
    let harness = BrokerHarness::new(
        endpoints(&auth_server.uri(), "ws://127.0.0.1:9/mcp"),
        browser,
        |config| {
            config.transport_preferences.callback_port = Some(0);
        },
    )
    .await;

    let err = harness
        .broker
        .sign_in(scopes(&["memories:read"]), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::StateMismatch));
}
