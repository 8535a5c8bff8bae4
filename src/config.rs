use crate::gateway::backend::{GatewayKind, SessionStrategy};
use crate::gateway::tls::CertPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_FALLBACK_TEXT: &str = "Sorry, I'm having trouble reaching the agent right now.";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// `[gateway]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub backend: GatewayKind,
    /// Gateway WebSocket URL; the backend's default when unset.
    pub url: Option<String>,
    /// Api key for the session-keyed gateway.
    pub api_key: Option<String>,
    pub agent_id: String,
    /// Explicit session key. Overrides `session_strategy`.
    pub session_key: Option<String>,
    pub session_strategy: SessionStrategy,
    /// OpenClaw state directory holding the device identity and tokens.
    pub identity_dir: Option<PathBuf>,
    pub turn_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Spoken when the agent does not answer in time.
    pub fallback_text: String,
    pub accept_invalid_certs: CertPolicy,
    /// Prefix prompts with the voice STT tag.
    pub voice_tagging: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend: GatewayKind::default(),
            url: None,
            api_key: None,
            agent_id: "main".to_string(),
            session_key: None,
            session_strategy: SessionStrategy::default(),
            identity_dir: None,
            turn_timeout_secs: 30,
            request_timeout_secs: 10,
            handshake_timeout_secs: 10,
            fallback_text: DEFAULT_FALLBACK_TEXT.to_string(),
            accept_invalid_certs: CertPolicy::default(),
            voice_tagging: true,
        }
    }
}

impl GatewayConfig {
    pub fn resolved_url(&self) -> String {
        self.url
            .clone()
            .unwrap_or_else(|| self.backend.default_url().to_string())
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Switch backend. A URL configured for the other backend is dropped.
    pub fn select_backend(&mut self, kind: GatewayKind) {
        if kind != self.backend {
            self.backend = kind;
            self.url = None;
        }
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.apply_overrides(None, lookup);
    }

    /// Settle the backend first (`backend` wins over `TALKY_GATEWAY_BACKEND`),
    /// then read that backend's URL and credentials from the environment.
    pub fn apply_overrides(
        &mut self,
        backend: Option<GatewayKind>,
        lookup: impl Fn(&str) -> Option<String>,
    ) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let from_env = get("TALKY_GATEWAY_BACKEND").and_then(|raw| {
            let kind = GatewayKind::parse(&raw);
            if kind.is_none() {
                tracing::warn!(value = %raw, "Ignoring unknown TALKY_GATEWAY_BACKEND");
            }
            kind
        });
        if let Some(kind) = backend.or(from_env) {
            self.select_backend(kind);
        }
        if let Some(url) = get(self.backend.url_env()) {
            self.url = Some(url);
        }
        if self.backend == GatewayKind::Moltis {
            if let Some(key) = get("MOLTIS_API_KEY") {
                self.api_key = Some(key);
            }
        }
    }
}

impl Config {
    /// `~/.talky/gateway.toml`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".talky")
            .join("gateway.toml")
    }

    /// Load configuration from file. A missing file yields defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = path.unwrap_or_else(Self::default_path);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<PathBuf>) -> Result<()> {
        let config_path = path.unwrap_or_else(Self::default_path);

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Apply `TALKY_GATEWAY_BACKEND`, `MOLTIS_GATEWAY_URL`, `MOLTIS_API_KEY`
    /// and `OPENCLAW_GATEWAY_URL`.
    pub fn apply_env(&mut self) {
        self.gateway.apply_env_from(|name| std::env::var(name).ok());
    }

    /// [`Config::apply_env`] with a backend chosen on the command line.
    pub fn apply_env_with_backend(&mut self, backend: Option<GatewayKind>) {
        self.gateway
            .apply_overrides(backend, |name| std::env::var(name).ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let gw = GatewayConfig::default();
        assert_eq!(gw.backend, GatewayKind::Moltis);
        assert_eq!(gw.resolved_url(), "wss://localhost:65491/ws");
        assert_eq!(gw.turn_timeout(), Duration::from_secs(30));
        assert_eq!(gw.request_timeout(), Duration::from_secs(10));
        assert!(gw.voice_tagging);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [gateway]
            backend = "openclaw"
            session_strategy = "daily"
            accept_invalid_certs = "never"
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.backend, GatewayKind::OpenClaw);
        assert_eq!(config.gateway.session_strategy, SessionStrategy::Daily);
        assert_eq!(config.gateway.accept_invalid_certs, CertPolicy::Never);
        assert_eq!(config.gateway.resolved_url(), "ws://localhost:18789");
        assert_eq!(config.gateway.agent_id, "main");
    }

    #[test]
    fn env_overrides_follow_backend() {
        let mut gw = GatewayConfig::default();
        gw.apply_env_from(env(&[
            ("TALKY_GATEWAY_BACKEND", "openclaw"),
            ("MOLTIS_GATEWAY_URL", "wss://moltis.local/ws"),
            ("OPENCLAW_GATEWAY_URL", "ws://10.0.0.2:18789"),
            ("MOLTIS_API_KEY", "secret"),
        ]));
        assert_eq!(gw.backend, GatewayKind::OpenClaw);
        assert_eq!(gw.url.as_deref(), Some("ws://10.0.0.2:18789"));
        assert_eq!(gw.api_key, None);

        let mut gw = GatewayConfig::default();
        gw.apply_env_from(env(&[("MOLTIS_API_KEY", "secret"), ("TALKY_GATEWAY_BACKEND", "bogus")]));
        assert_eq!(gw.backend, GatewayKind::Moltis);
        assert_eq!(gw.api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn cli_backend_reads_its_own_env_url() {
        let mut gw = GatewayConfig {
            url: Some("wss://moltis.file/ws".into()),
            ..Default::default()
        };
        gw.apply_overrides(
            Some(GatewayKind::OpenClaw),
            env(&[
                ("TALKY_GATEWAY_BACKEND", "moltis"),
                ("OPENCLAW_GATEWAY_URL", "ws://10.0.0.2:18789"),
                ("MOLTIS_API_KEY", "secret"),
            ]),
        );
        assert_eq!(gw.backend, GatewayKind::OpenClaw);
        assert_eq!(gw.url.as_deref(), Some("ws://10.0.0.2:18789"));
        assert_eq!(gw.api_key, None);
    }

    #[test]
    fn switching_backend_drops_file_url() {
        let mut gw = GatewayConfig {
            url: Some("wss://moltis.file/ws".into()),
            ..Default::default()
        };
        gw.apply_overrides(Some(GatewayKind::OpenClaw), env(&[]));
        assert_eq!(gw.resolved_url(), "ws://localhost:18789");

        let mut gw = GatewayConfig {
            url: Some("wss://moltis.file/ws".into()),
            ..Default::default()
        };
        gw.apply_overrides(Some(GatewayKind::Moltis), env(&[]));
        assert_eq!(gw.url.as_deref(), Some("wss://moltis.file/ws"));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gateway.toml");

        let mut config = Config::default();
        config.gateway.session_key = Some("agent:main:kitchen".into());
        config.gateway.turn_timeout_secs = 45;
        config.save(Some(path.clone())).unwrap();

        assert_eq!(Config::load(Some(path)).unwrap(), config);
    }

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config, Config::default());
    }
}
