//! Device challenge-response against an in-process OpenClaw-style gateway.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use talky_gateway::gateway::{ConnectionState, FileIdentityStore, TurnOutcome};
use talky_gateway::{GatewayError, IdentityError};

const SEED: [u8; 32] = [7; 32];

fn openclaw_client(url: &str, root: &std::path::Path) -> Arc<talky_gateway::GatewayClient> {
    client(
        openclaw_config(url, root),
        Arc::new(FileIdentityStore::new(root)),
    )
}

#[tokio::test]
async fn test_challenge_is_answered_with_signed_device_block() {
    let dir = tempfile::tempdir().unwrap();
    write_identity(dir.path(), "dev-1", SEED, "gw-token");
    let mut gw = MockGateway::start().await;
    let client = openclaw_client(&gw.url, dir.path());

    let c = client.clone();
    let task = tokio::spawn(async move { c.ensure_connected().await });
    let mut session = gw.next_session().await;

    let first = session.expect_request("connect").await;
    assert_eq!(first["params"]["auth"]["token"], "gw-token");
    assert!(first["params"].get("device").is_none());
    session
        .event("connect.challenge", json!({"nonce": "abc", "ts": 1_737_264_000_000_i64}))
        .await;

    let second = session.expect_request("connect").await;
    let payload = verify_device_block(&second["params"], &public_key(SEED));
    let fields: Vec<&str> = payload.split('|').collect();
    assert_eq!(fields.len(), 9);
    assert_eq!(fields[0], "v2");
    assert_eq!(fields[1], "dev-1");
    assert_eq!(fields[7], "gw-token");
    assert_eq!(fields[8], "abc");

    let signed_at = second["params"]["device"]["signedAt"].as_i64().unwrap();
    let now = chrono::Utc::now().timestamp_millis();
    assert!((now - signed_at).abs() < 60_000, "stale signedAt {signed_at}");

    session.reply_ok(&second, json!({"type": "hello-ok"})).await;
    task.await.unwrap().unwrap();
    assert_eq!(client.state(), ConnectionState::Authenticated);

    // Keyed sessions: no switch, the key rides on every chat.send.
    let c = client.clone();
    let turn = tokio::spawn(async move { c.send_prompt("hello").await });
    let req = session.expect_request("chat.send").await;
    assert_eq!(req["params"]["sessionKey"], "voice-session");
    assert_eq!(req["params"]["message"], "[TALKY VOICE STT]: hello");
    session.reply_ok(&req, json!({"runId": "run-9"})).await;
    session
        .event(
            "chat",
            json!({
                "runId": "run-9",
                "state": "final",
                "message": {"role": "assistant", "content": [{"type": "text", "text": "Hi!"}]}
            }),
        )
        .await;

    assert_eq!(
        turn.await.unwrap().unwrap(),
        TurnOutcome::Completed("Hi!".into())
    );
}

#[tokio::test]
async fn test_operator_token_when_no_gateway_token() {
    let dir = tempfile::tempdir().unwrap();
    write_identity(dir.path(), "dev-2", SEED, "");
    let mut gw = MockGateway::start().await;
    let client = openclaw_client(&gw.url, dir.path());

    let c = client.clone();
    let task = tokio::spawn(async move { c.ensure_connected().await });
    let mut session = gw.next_session().await;

    let first = session.expect_request("connect").await;
    assert_eq!(first["params"]["auth"]["token"], "operator-token");
    session.event("connect.challenge", json!({"nonce": "n-2"})).await;

    let second = session.expect_request("connect").await;
    let payload = verify_device_block(&second["params"], &public_key(SEED));
    assert!(payload.ends_with("|operator-token|n-2"), "{payload}");
    session.reply_ok(&second, json!({})).await;

    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_device_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    write_identity(dir.path(), "dev-3", SEED, "gw-token");
    let mut gw = MockGateway::start().await;
    let client = openclaw_client(&gw.url, dir.path());

    let c = client.clone();
    let task = tokio::spawn(async move { c.ensure_connected().await });
    let mut session = gw.next_session().await;

    session.expect_request("connect").await;
    session.event("connect.challenge", json!({"nonce": "abc"})).await;
    let second = session.expect_request("connect").await;
    session.reply_err(&second, "pairing required").await;

    let err = task.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("pairing required"), "{err}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_challenge_without_nonce_fails_handshake() {
    let dir = tempfile::tempdir().unwrap();
    write_identity(dir.path(), "dev-4", SEED, "gw-token");
    let mut gw = MockGateway::start().await;
    let client = openclaw_client(&gw.url, dir.path());

    let c = client.clone();
    let task = tokio::spawn(async move { c.ensure_connected().await });
    let mut session = gw.next_session().await;

    session.expect_request("connect").await;
    session.event("connect.challenge", json!({})).await;

    let err = task.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("nonce"), "{err}");
}

#[tokio::test]
async fn test_non_ed25519_key_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    write_identity(dir.path(), "dev-5", SEED, "gw-token");
    replace_with_x25519_key(dir.path(), SEED);
    let mut gw = MockGateway::start().await;
    let client = openclaw_client(&gw.url, dir.path());

    let c = client.clone();
    let task = tokio::spawn(async move { c.ensure_connected().await });
    let mut session = gw.next_session().await;

    session.expect_request("connect").await;
    session.event("connect.challenge", json!({"nonce": "abc"})).await;

    let err = task.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("Ed25519"), "{err}");
}

#[tokio::test]
async fn test_missing_identity_never_dials() {
    let dir = tempfile::tempdir().unwrap();
    let gw = MockGateway::start().await;
    let client = openclaw_client(&gw.url, dir.path());

    let err = client.ensure_connected().await.unwrap_err();
    assert!(
        matches!(err, GatewayError::Identity(IdentityError::Missing(_))),
        "{err}"
    );
    assert_eq!(gw.connection_count(), 0);
}
