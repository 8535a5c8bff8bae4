//! Shared fixtures: an in-process mock gateway and device key material.

#![allow(dead_code)]

use base64::Engine;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::{EncodePrivateKey, EncodePublicKey};
use ed25519_dalek::{Signature, SigningKey, Verifier, VerifyingKey};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use talky_gateway::config::GatewayConfig;
use talky_gateway::gateway::{
    FileIdentityStore, GatewayClient, GatewayKind, IdentityStore, WsConnector,
};
use talky_gateway::retry::RetryPolicy;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

pub const STEP: Duration = Duration::from_secs(5);

// ── Mock gateway ────────────────────────────────────────────────────────────

/// Loopback WebSocket server. Each accepted connection is handed to the test
/// as a [`Session`] it drives frame by frame.
pub struct MockGateway {
    pub url: String,
    sessions: mpsc::UnboundedReceiver<Session>,
    connections: Arc<AtomicUsize>,
}

impl MockGateway {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                if tx.send(Session { ws }).is_err() {
                    break;
                }
            }
        });

        Self {
            url,
            sessions: rx,
            connections,
        }
    }

    pub async fn next_session(&mut self) -> Session {
        timeout(STEP, self.sessions.recv())
            .await
            .expect("no connection within timeout")
            .expect("accept loop ended")
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

pub struct Session {
    ws: WebSocketStream<TcpStream>,
}

impl Session {
    /// Next JSON text frame from the client.
    pub async fn recv_json(&mut self) -> Value {
        loop {
            let msg = timeout(STEP, self.ws.next())
                .await
                .expect("no frame within timeout")
                .expect("client closed the socket")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).expect("client sent invalid JSON");
            }
        }
    }

    /// Next request, asserting its method.
    pub async fn expect_request(&mut self, method: &str) -> Value {
        let req = self.recv_json().await;
        assert_eq!(req["type"], "req", "unexpected frame: {req}");
        assert_eq!(req["method"], method, "unexpected request: {req}");
        req
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    pub async fn reply_ok(&mut self, req: &Value, result: Value) {
        self.send_json(json!({"type": "res", "id": req["id"], "ok": true, "result": result}))
            .await;
    }

    pub async fn reply_err(&mut self, req: &Value, message: &str) {
        self.send_json(json!({
            "type": "res",
            "id": req["id"],
            "ok": false,
            "error": {"message": message}
        }))
        .await;
    }

    pub async fn event(&mut self, name: &str, payload: Value) {
        self.send_json(json!({"type": "event", "event": name, "payload": payload}))
            .await;
    }

    /// Accept a plain `connect`; returns its params.
    pub async fn accept_connect(&mut self) -> Value {
        let req = self.expect_request("connect").await;
        self.reply_ok(&req, json!({})).await;
        req["params"].clone()
    }

    /// Accept `connect` then the `sessions.switch` that follows on Moltis.
    pub async fn accept_moltis(&mut self) -> String {
        self.accept_connect().await;
        let switch = self.expect_request("sessions.switch").await;
        self.reply_ok(&switch, json!({})).await;
        switch["params"]["key"].as_str().unwrap().to_string()
    }

    /// Whether the client has closed its side.
    pub async fn closed(&mut self) -> bool {
        loop {
            match timeout(STEP, self.ws.next()).await {
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }

    pub async fn drop_connection(mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ── Clients ─────────────────────────────────────────────────────────────────

pub fn moltis_config(url: &str) -> GatewayConfig {
    GatewayConfig {
        backend: GatewayKind::Moltis,
        url: Some(url.to_string()),
        turn_timeout_secs: 2,
        request_timeout_secs: 2,
        handshake_timeout_secs: 2,
        ..Default::default()
    }
}

pub fn openclaw_config(url: &str, identity_dir: &Path) -> GatewayConfig {
    GatewayConfig {
        backend: GatewayKind::OpenClaw,
        url: Some(url.to_string()),
        identity_dir: Some(identity_dir.to_path_buf()),
        turn_timeout_secs: 2,
        request_timeout_secs: 2,
        handshake_timeout_secs: 2,
        ..Default::default()
    }
}

pub fn client(config: GatewayConfig, store: Arc<dyn IdentityStore>) -> Arc<GatewayClient> {
    Arc::new(
        GatewayClient::new(
            config.clone(),
            Arc::new(WsConnector::new(config.accept_invalid_certs)),
            store,
        )
        .with_retry_policy(RetryPolicy::none()),
    )
}

pub fn moltis_client(url: &str) -> Arc<GatewayClient> {
    let store = Arc::new(FileIdentityStore::new(std::env::temp_dir().join("talky-no-identity")));
    client(moltis_config(url), store)
}

// ── Device keys ─────────────────────────────────────────────────────────────

/// PKCS#8 header for an X25519 key. The encoder only speaks Ed25519.
const PKCS8_X25519_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x04, 0x22, 0x04, 0x20,
];

fn pem(label: &str, der: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    format!("-----BEGIN {label}-----\n{b64}\n-----END {label}-----\n")
}

pub fn public_key(seed: [u8; 32]) -> VerifyingKey {
    SigningKey::from_bytes(&seed).verifying_key()
}

/// Lay out an OpenClaw state directory for `device_id`.
pub fn write_identity(root: &Path, device_id: &str, seed: [u8; 32], gateway_token: &str) {
    let signing = SigningKey::from_bytes(&seed);
    let private_pem = signing.to_pkcs8_pem(LineEnding::LF).unwrap();
    let public_pem = signing
        .verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap();

    let write = |rel: &str, value: Value| {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    };
    write(
        "identity/device.json",
        json!({
            "version": 1,
            "deviceId": device_id,
            "publicKeyPem": public_pem,
            "privateKeyPem": private_pem.as_str(),
            "createdAtMs": 1_700_000_000_000_i64
        }),
    );
    write(
        "openclaw.json",
        json!({"gateway": {"auth": {"token": gateway_token}}}),
    );
    write(
        "devices/paired.json",
        json!({device_id: {"tokens": {"operator": {"token": "operator-token"}}}}),
    );
}

/// Swap the device's private key for an X25519 one.
pub fn replace_with_x25519_key(root: &Path, seed: [u8; 32]) {
    let path = root.join("identity/device.json");
    let mut device: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let der = [&PKCS8_X25519_PREFIX[..], &seed[..]].concat();
    device["privateKeyPem"] = Value::String(pem("PRIVATE KEY", &der));
    std::fs::write(path, device.to_string()).unwrap();
}

/// Check a `device` block the way the gateway does: rebuild the payload
/// from the connect params and verify it against the advertised key.
pub fn verify_device_block(params: &Value, expected_key: &VerifyingKey) -> String {
    let device = &params["device"];
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;

    let advertised: [u8; 32] = engine
        .decode(device["publicKey"].as_str().unwrap())
        .unwrap()
        .try_into()
        .unwrap();
    assert_eq!(&advertised, expected_key.as_bytes(), "public key mismatch");

    let scopes: Vec<&str> = params["scopes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s.as_str().unwrap())
        .collect();
    let payload = [
        "v2".to_string(),
        device["id"].as_str().unwrap().to_string(),
        params["client"]["id"].as_str().unwrap().to_string(),
        params["client"]["mode"].as_str().unwrap().to_string(),
        params["role"].as_str().unwrap().to_string(),
        scopes.join(","),
        device["signedAt"].as_i64().unwrap().to_string(),
        params["auth"]["token"].as_str().unwrap_or_default().to_string(),
        device["nonce"].as_str().unwrap().to_string(),
    ]
    .join("|");

    let sig: [u8; 64] = engine
        .decode(device["signature"].as_str().unwrap())
        .unwrap()
        .try_into()
        .unwrap();
    expected_key
        .verify(payload.as_bytes(), &Signature::from_bytes(&sig))
        .expect("device signature does not verify");
    payload
}
