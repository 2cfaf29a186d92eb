//! Token lifecycle integration: silent refresh and revocation against a
//! mocked token endpoint.

use lanonasis_core::domain::AuthMaterial;
use lanonasis_core::error::BrokerError;
use pretty_assertions::assert_eq;
use tests::{endpoints, BrokerHarness, RedirectingBrowser};
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn harness_against(auth_server: &MockServer) -> BrokerHarness {
    BrokerHarness::new(
        endpoints(&auth_server.uri(), "ws://127.0.0.1:9/mcp"),
        RedirectingBrowser::new("unused"),
        |_| {},
    )
    .await
}

#[tokio::test]
async fn silent_refresh_is_single_flight() {
    let auth_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=RT1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"access_token": "AT2", "expires_in": 3600}))
                // Widen the race window so both callers overlap.
                .set_delay(std::time::Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&auth_server)
        .await;

    let harness = harness_against(&auth_server).await;
    harness.seed_expired_oauth("RT1").await;

    // Two parallel acquires against the same expired token.
    let (first, second) = tokio::join!(
        harness.broker.acquire_auth(),
        harness.broker.acquire_auth()
    );

    for result in [first.unwrap(), second.unwrap()] {
        match result {
            AuthMaterial::Bearer(token) => assert_eq!(token, "AT2"),
            other => panic!("expected Bearer, got {:?}", other),
        }
    }

    // Stored token rotated to AT2; refresh token preserved.
    let token = harness
        .broker
        .credential_store()
        .get()
        .await
        .unwrap()
        .unwrap()
        .token()
        .unwrap();
    assert_eq!(token.access_token, "AT2");
    assert_eq!(token.refresh_token.as_deref(), Some("RT1"));
    // wiremock verifies expect(1) on drop: exactly one POST.
}

#[tokio::test]
async fn revoked_refresh_token_purges_and_requires_reauthentication() {
    let auth_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(serde_json::json!({"error": "invalid_grant"}))
                .set_delay(std::time::Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&auth_server)
        .await;

    let harness = harness_against(&auth_server).await;
    harness.seed_expired_oauth("RT1").await;

    let (first, second) = tokio::join!(
        harness.broker.acquire_auth(),
        harness.broker.acquire_auth()
    );

    assert!(matches!(
        first.unwrap_err(),
        BrokerError::ReauthenticationRequired
    ));
    assert!(matches!(
        second.unwrap_err(),
        BrokerError::ReauthenticationRequired
    ));

    assert!(
        harness.broker.credential_store().get().await.unwrap().is_none(),
        "credential must be purged"
    );
}

#[tokio::test]
async fn transient_refresh_failure_retries_then_surfaces() {
    let auth_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(503))
        // Initial attempt plus the 250/500/1000 ms backoff retries.
        .expect(4)
        .mount(&auth_server)
        .await;

    let harness = harness_against(&auth_server).await;
    harness.seed_expired_oauth("RT1").await;

    let err = harness.broker.acquire_auth().await.unwrap_err();
    assert!(matches!(err, BrokerError::TokenRefreshTransient(_)));

    // The credential survives a transient failure.
    assert!(harness.broker.credential_store().get().await.unwrap().is_some());
}

#[tokio::test]
async fn new_refresh_token_is_rotated_into_storage() {
    let auth_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "AT2",
            "refresh_token": "RT2",
            "expires_in": 3600,
        })))
        .expect(1)
        .mount(&auth_server)
        .await;

    let harness = harness_against(&auth_server).await;
    harness.seed_expired_oauth("RT1").await;

    harness.broker.acquire_auth().await.unwrap();
    let token = harness
        .broker
        .credential_store()
        .get()
        .await
        .unwrap()
        .unwrap()
        .token()
        .unwrap();
    assert_eq!(token.refresh_token.as_deref(), Some("RT2"));
}
