//! Typed `params` payloads for the requests this client sends.
//!
//! These serialize to the camelCase JSON the gateway expects and are
//! embedded into [`super::RequestFrame::params`] via `serde_json::to_value`.

use serde::{Deserialize, Serialize};

/// Only protocol version spoken by this client.
pub const PROTOCOL_VERSION: u32 = 3;

/// `connect` request params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceAuth>,
}

impl ConnectParams {
    pub fn new(client: ClientInfo) -> Self {
        Self {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client,
            role: None,
            scopes: Vec::new(),
            auth: None,
            device: None,
        }
    }
}

/// Client descriptor sent with `connect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
}

/// Credential block of `connect`. Exactly one field is set per backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl ConnectAuth {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            token: None,
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self {
            api_key: None,
            token: Some(token.into()),
        }
    }
}

/// Signed device block answering a `connect.challenge`.
///
/// `public_key` is the raw 32-byte Ed25519 key and `signature` the raw
/// 64-byte signature, both unpadded URL-safe base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuth {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: i64,
    pub nonce: String,
}

/// `chat.send` params.
///
/// The session-keyed backend tracks the active session server-side and takes
/// `text`; the device-authenticated backend names the session on every call
/// and takes `message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatSendParams {
    #[serde(rename_all = "camelCase")]
    Session {
        text: String,
        idempotency_key: String,
    },
    #[serde(rename_all = "camelCase")]
    Keyed {
        session_key: String,
        message: String,
        idempotency_key: String,
    },
}

impl ChatSendParams {
    pub fn idempotency_key(&self) -> &str {
        match self {
            Self::Session {
                idempotency_key, ..
            }
            | Self::Keyed {
                idempotency_key, ..
            } => idempotency_key,
        }
    }
}

/// `sessions.switch` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSwitchParams {
    pub key: String,
}
