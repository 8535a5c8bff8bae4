//! Per-backend protocol profile.
//!
//! Both gateways speak the same envelope protocol but differ in the client
//! descriptor, the credential they expect, how `chat.send` names the session,
//! and whether the session is selected once per connection.

use super::identity::AuthClaims;
use super::protocol::{
    ChatSendParams, ClientInfo, ConnectAuth, ConnectParams, DeviceAuth,
};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

pub const CLIENT_VERSION: &str = "1.0.0";

/// Which gateway the client talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    /// Session-keyed gateway, optional api key.
    #[default]
    Moltis,
    /// Device-authenticated gateway with Ed25519 challenge-response.
    #[serde(rename = "openclaw")]
    OpenClaw,
}

impl GatewayKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "moltis" => Some(Self::Moltis),
            "openclaw" => Some(Self::OpenClaw),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Moltis => "moltis",
            Self::OpenClaw => "openclaw",
        }
    }

    pub fn default_url(self) -> &'static str {
        match self {
            Self::Moltis => "wss://localhost:65491/ws",
            Self::OpenClaw => "ws://localhost:18789",
        }
    }

    /// Environment variable that overrides the gateway URL.
    pub fn url_env(self) -> &'static str {
        match self {
            Self::Moltis => "MOLTIS_GATEWAY_URL",
            Self::OpenClaw => "OPENCLAW_GATEWAY_URL",
        }
    }
}

impl std::fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the session key is derived when none is configured explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStrategy {
    /// `agent:<id>:voice`, the same conversation every time.
    #[default]
    Persistent,
    /// Fresh timestamped session on every (re)connect.
    PerConnection,
    /// Fresh timestamped session per client instance.
    New,
    /// One session per local calendar day.
    Daily,
}

impl SessionStrategy {
    /// Unknown names fall back to `Persistent`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "per-connection" | "per_connection" => Self::PerConnection,
            "new" => Self::New,
            "daily" => Self::Daily,
            _ => Self::Persistent,
        }
    }

    pub fn session_key(self, agent_id: &str, now: DateTime<Local>) -> String {
        match self {
            Self::Persistent => format!("agent:{agent_id}:voice"),
            Self::PerConnection | Self::New => {
                format!("agent:{agent_id}:voice-{}", now.timestamp())
            }
            Self::Daily => format!("agent:{agent_id}:voice-{}", now.format("%Y-%m-%d")),
        }
    }

    /// Whether a reconnect should mint a new key.
    pub fn renews_on_connect(self) -> bool {
        matches!(self, Self::PerConnection)
    }
}

/// Default session key of the device-authenticated gateway.
pub const OPENCLAW_SESSION_KEY: &str = "voice-session";

/// `idempotencyKey` for a `chat.send` with request id `id`.
pub fn idempotency_key(id: &str) -> String {
    format!("pipecat-{id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProfile {
    pub kind: GatewayKind,
    pub client: ClientInfo,
    pub role: Option<String>,
    pub scopes: Vec<String>,
}

impl BackendProfile {
    pub fn for_kind(kind: GatewayKind) -> Self {
        match kind {
            GatewayKind::Moltis => Self {
                kind,
                client: ClientInfo {
                    id: "pipecat-voice".into(),
                    version: CLIENT_VERSION.into(),
                    platform: "rust".into(),
                    mode: "voice".into(),
                },
                role: None,
                scopes: Vec::new(),
            },
            GatewayKind::OpenClaw => Self {
                kind,
                client: ClientInfo {
                    id: "cli".into(),
                    version: CLIENT_VERSION.into(),
                    platform: std::env::consts::OS.into(),
                    mode: "cli".into(),
                },
                role: Some("operator".into()),
                scopes: vec![
                    "operator.admin".into(),
                    "operator.approvals".into(),
                    "operator.pairing".into(),
                ],
            },
        }
    }

    /// Device identity is needed to answer challenges.
    pub fn uses_device_identity(&self) -> bool {
        self.kind == GatewayKind::OpenClaw
    }

    /// The active session is server-side state selected with `sessions.switch`.
    pub fn switches_session_on_connect(&self) -> bool {
        self.kind == GatewayKind::Moltis
    }

    pub fn connect_params(
        &self,
        auth: Option<ConnectAuth>,
        device: Option<DeviceAuth>,
    ) -> ConnectParams {
        let mut params = ConnectParams::new(self.client.clone());
        params.role = self.role.clone();
        params.scopes = self.scopes.clone();
        params.auth = auth;
        params.device = device;
        params
    }

    /// Claims to sign when answering a challenge with `nonce`.
    pub fn claims(&self, token: &str, nonce: &str) -> AuthClaims {
        AuthClaims {
            client_id: self.client.id.clone(),
            client_mode: self.client.mode.clone(),
            role: self.role.clone().unwrap_or_default(),
            scopes: self.scopes.clone(),
            token: token.to_string(),
            nonce: nonce.to_string(),
        }
    }

    pub fn chat_send(&self, session_key: &str, text: String, request_id: &str) -> ChatSendParams {
        let idempotency_key = idempotency_key(request_id);
        match self.kind {
            GatewayKind::Moltis => ChatSendParams::Session {
                text,
                idempotency_key,
            },
            GatewayKind::OpenClaw => ChatSendParams::Keyed {
                session_key: session_key.to_string(),
                message: text,
                idempotency_key,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn session_keys_per_strategy() {
        let now = Local.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let ts = now.timestamp();

        assert_eq!(
            SessionStrategy::Persistent.session_key("main", now),
            "agent:main:voice"
        );
        assert_eq!(
            SessionStrategy::PerConnection.session_key("main", now),
            format!("agent:main:voice-{ts}")
        );
        assert_eq!(
            SessionStrategy::New.session_key("ops", now),
            format!("agent:ops:voice-{ts}")
        );
        assert_eq!(
            SessionStrategy::Daily.session_key("main", now),
            "agent:main:voice-2026-03-14"
        );
    }

    #[test]
    fn unknown_strategy_is_persistent() {
        assert_eq!(SessionStrategy::parse("weekly"), SessionStrategy::Persistent);
        assert_eq!(SessionStrategy::parse("Daily"), SessionStrategy::Daily);
        assert_eq!(
            SessionStrategy::parse("per-connection"),
            SessionStrategy::PerConnection
        );
    }

    #[test]
    fn kind_parsing_and_urls() {
        assert_eq!(GatewayKind::parse("OpenClaw"), Some(GatewayKind::OpenClaw));
        assert_eq!(GatewayKind::parse("moltis"), Some(GatewayKind::Moltis));
        assert_eq!(GatewayKind::parse("pi"), None);
        assert_eq!(GatewayKind::OpenClaw.default_url(), "ws://localhost:18789");
    }

    #[test]
    fn openclaw_profile_connect_params() {
        let profile = BackendProfile::for_kind(GatewayKind::OpenClaw);
        let params = profile.connect_params(Some(ConnectAuth::token("t")), None);
        let v = serde_json::to_value(&params).unwrap();
        assert_eq!(v["client"]["id"], "cli");
        assert_eq!(v["client"]["mode"], "cli");
        assert_eq!(v["role"], "operator");
        assert_eq!(
            v["scopes"],
            serde_json::json!(["operator.admin", "operator.approvals", "operator.pairing"])
        );
    }

    #[test]
    fn moltis_profile_omits_role_and_scopes() {
        let profile = BackendProfile::for_kind(GatewayKind::Moltis);
        let v = serde_json::to_value(profile.connect_params(None, None)).unwrap();
        assert_eq!(v["client"]["id"], "pipecat-voice");
        assert_eq!(v["client"]["mode"], "voice");
        assert!(v.get("role").is_none());
        assert!(v.get("scopes").is_none());
        assert!(v.get("auth").is_none());
    }

    #[test]
    fn chat_send_uses_idempotency_key_from_id() {
        let moltis = BackendProfile::for_kind(GatewayKind::Moltis);
        let params = moltis.chat_send("ignored", "hi".into(), "17");
        assert_eq!(params.idempotency_key(), "pipecat-17");
        assert!(matches!(params, ChatSendParams::Session { .. }));

        let openclaw = BackendProfile::for_kind(GatewayKind::OpenClaw);
        match openclaw.chat_send("voice-session", "hi".into(), "18") {
            ChatSendParams::Keyed { session_key, .. } => assert_eq!(session_key, "voice-session"),
            other => panic!("unexpected params {other:?}"),
        }
    }
}
