//! Storage and configuration integrity integration tests.

use std::sync::Arc;

use lanonasis_broker::{Broker, BrokerOptions, DiagnosticsOptions};
use lanonasis_core::defaults::CONFIG_FILE;
use lanonasis_core::domain::credential::sha256_hex;
use lanonasis_core::domain::{now_ms, Credential, SectionStatus, TokenRecord};
use lanonasis_storage::{FileBackend, StorageBackend};
use pretty_assertions::assert_eq;
use tests::RedirectingBrowser;

fn broker_over(backend: Arc<dyn StorageBackend>) -> Broker {
    Broker::new(BrokerOptions {
        backend: Some(backend),
        client_id: "test-client".to_string(),
        browser: RedirectingBrowser::new("unused"),
        timeouts: Default::default(),
    })
    .unwrap()
}

#[tokio::test]
async fn corrupt_config_repair_backs_up_original_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FileBackend::new(dir.path()));
    backend.write(CONFIG_FILE, "garbage: not json").await.unwrap();

    let broker = broker_over(backend.clone());
    let report = broker
        .run_diagnostics(DiagnosticsOptions {
            repair: true,
            verbose: false,
        })
        .await;

    let integrity = report
        .sections
        .iter()
        .find(|s| s.section == "Configuration Integrity")
        .unwrap();
    assert_eq!(integrity.status, SectionStatus::Warn);
    assert!(
        !integrity.recommended_actions.is_empty(),
        "repair records an action"
    );

    // Backup file holds the original bytes verbatim.
    let backups = backend.list_backups(CONFIG_FILE).await.unwrap();
    assert_eq!(backups.len(), 1);
    let original = std::fs::read_to_string(dir.path().join(&backups[0])).unwrap();
    assert_eq!(original, "garbage: not json");

    // A valid config with the current schema version was written.
    let rewritten = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&rewritten).unwrap();
    assert_eq!(
        parsed["version"],
        lanonasis_core::domain::CONFIG_SCHEMA_VERSION
    );
}

#[tokio::test]
async fn credential_round_trip_laws() {
    let dir = tempfile::tempdir().unwrap();
    let broker = broker_over(Arc::new(FileBackend::new(dir.path())));
    let store = broker.credential_store();

    // Plaintext API key: stored form is its SHA-256, never the plaintext.
    store.set(Credential::api_key("plaintext-key")).await.unwrap();
    match store.get().await.unwrap().unwrap() {
        Credential::ApiKey { hash } => assert_eq!(hash, sha256_hex("plaintext-key")),
        other => panic!("expected apiKey, got {:?}", other),
    }
    let on_disk = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
    assert!(!on_disk.contains("plaintext-key"));

    // Already-hashed input is idempotent.
    let hashed = sha256_hex("plaintext-key");
    store.set(Credential::api_key(&hashed)).await.unwrap();
    match store.get().await.unwrap().unwrap() {
        Credential::ApiKey { hash } => assert_eq!(hash, hashed),
        other => panic!("expected apiKey, got {:?}", other),
    }

    // OAuth credential round-trips structurally.
    let record = TokenRecord {
        access_token: "AT1".to_string(),
        expires_at: now_ms() + 3_600_000,
        refresh_token: Some("RT1".to_string()),
        scope: ["memories:read".to_string()].into_iter().collect(),
    };
    store.set(Credential::oauth(record.clone())).await.unwrap();
    let loaded = store.get().await.unwrap().unwrap().token().unwrap();
    assert_eq!(loaded, record);
}

#[tokio::test]
async fn expiry_buffer_boundary_excludes_equality() {
    let record = TokenRecord {
        access_token: "AT".to_string(),
        expires_at: now_ms() + 60_000,
        refresh_token: None,
        scope: Default::default(),
    };
    // Exactly now + 60s is invalid; the buffer excludes equality.
    assert!(!record.is_valid());
}

#[tokio::test]
async fn legacy_plaintext_config_is_hashed_on_first_read() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FileBackend::new(dir.path()));
    backend
        .write(CONFIG_FILE, r#"{"apiKey": "legacy-secret"}"#)
        .await
        .unwrap();

    let broker = broker_over(backend.clone());
    let credential = broker.credential_store().get().await.unwrap().unwrap();
    match credential {
        Credential::ApiKey { hash } => assert_eq!(hash, sha256_hex("legacy-secret")),
        other => panic!("expected apiKey, got {:?}", other),
    }

    // The rewrite erased the plaintext from disk.
    let on_disk = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
    assert!(!on_disk.contains("legacy-secret"));
    // And the prior bytes were kept as a backup first.
    let backups = backend.list_backups(CONFIG_FILE).await.unwrap();
    assert_eq!(backups.len(), 1);
}

#[tokio::test]
async fn offline_diagnostics_produce_full_report() {
    let dir = tempfile::tempdir().unwrap();
    let broker = broker_over(Arc::new(FileBackend::new(dir.path())));

    // Pin endpoints at a dead port so nothing resolves, then run: the
    // report must still be produced with skips, not an error.
    broker
        .pin_endpoint("memoryBase", "http://127.0.0.1:9".to_string())
        .await
        .unwrap();

    let report = broker.run_diagnostics(DiagnosticsOptions::default()).await;
    assert_eq!(report.sections.len(), 7);
    let session = report
        .sections
        .iter()
        .find(|s| s.section == "Current MCP Session")
        .unwrap();
    assert_eq!(session.status, SectionStatus::Skip);
}
