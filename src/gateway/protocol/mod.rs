//! Wire protocol for gateway WebSocket communication.
//!
//! Every message on the socket is one JSON text frame carrying an envelope
//! tagged by its `type` field:
//!
//! - `req`: client → gateway call, answered by a `res` with the same `id`
//! - `res`: gateway → client result for a previous `req`
//! - `event`: gateway → client push (challenge, chat deltas, health)
//!
//! Frames are decoded once here into [`Envelope`]; everything downstream
//! matches on the variant instead of probing for keys.

pub mod types;

pub use types::{
    ChatSendParams, ClientInfo, ConnectAuth, ConnectParams, DeviceAuth, PROTOCOL_VERSION,
    SessionSwitchParams,
};

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One discrete message unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

/// Client → gateway call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

/// Gateway → client result.
///
/// Some gateways put the result under `payload` instead of `result`; both
/// are accepted. A missing `id` decodes as empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(default)]
    pub id: String,
    pub ok: bool,
    #[serde(
        default,
        alias = "payload",
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

/// Gateway → client push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "event")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorShape {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl Envelope {
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self::Request(RequestFrame {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Self::Event(EventFrame {
            name: name.into(),
            payload,
            seq: None,
        })
    }

    /// Short label for log lines: `req:chat.send`, `res:42`, `event:chat`.
    pub fn label(&self) -> String {
        match self {
            Self::Request(r) => format!("req:{}", r.method),
            Self::Response(r) => format!("res:{}", r.id),
            Self::Event(e) => format!("event:{}", e.name),
        }
    }
}

/// A field that is present is `Some`, even when it holds `null`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(ErrorShape {
                code: None,
                message: message.into(),
            }),
        }
    }

    /// Human-readable reason for a failed response.
    pub fn error_message(&self) -> String {
        match &self.error {
            Some(e) if !e.message.is_empty() => e.message.clone(),
            Some(ErrorShape {
                code: Some(code), ..
            }) => code.clone(),
            _ => "Unknown error".to_string(),
        }
    }
}

/// Serialize an envelope into a text frame.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    serde_json::to_string(envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Parse a text frame into an envelope.
///
/// Anything that is not a JSON object with a known `type` tag is
/// [`ProtocolError::Malformed`]; callers log and drop such frames.
pub fn decode(frame: &str) -> Result<Envelope, ProtocolError> {
    serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
}
