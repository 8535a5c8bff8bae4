//! The gateway client the voice pipeline talks to.
//!
//! Composes the connection, correlator and aggregator into four verbs:
//! [`GatewayClient::ensure_connected`], [`GatewayClient::send_prompt`],
//! [`GatewayClient::cancel_pending`] and [`GatewayClient::switch_session`].
//! [`GatewayClient::respond`] wraps a full pipeline turn (transcript in,
//! started/text/ended signals out).

use super::aggregator::{StreamingAggregator, TurnOutcome};
use super::backend::{BackendProfile, GatewayKind, OPENCLAW_SESSION_KEY};
use super::connection::{ClientEvent, ConnectionManager, ConnectionState, Handshake};
use super::correlator::RequestCorrelator;
use super::identity::{FileIdentityStore, IdentityStore};
use super::protocol::{ConnectAuth, Envelope, ResponseFrame, SessionSwitchParams};
use super::transport::{Connector, WsConnector};
use crate::config::GatewayConfig;
use crate::error::{CallError, GatewayError, ProtocolError, Result};
use crate::logging::preview;
use crate::retry::{RetryPolicy, classify_connect_error, retry_with_backoff};
use crate::voice::{TranscriptTurn, format_voice_message, latest_user_utterance};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, OnceCell, broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};

/// What the pipeline hears back for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseSignal {
    Started,
    Text(String),
    Ended,
}

pub struct GatewayClient {
    config: GatewayConfig,
    profile: BackendProfile,
    url: String,
    store: Arc<dyn IdentityStore>,
    correlator: Arc<RequestCorrelator>,
    aggregator: Arc<StreamingAggregator>,
    connection: Arc<ConnectionManager>,
    handshake: OnceCell<Handshake>,
    session_key: RwLock<String>,
    connects: AtomicU64,
    retry: RetryPolicy,
    ensure_lock: Mutex<()>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("backend", &self.profile.kind)
            .field("url", &self.url)
            .field("session_key", &self.session_key())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl GatewayClient {
    pub fn new(
        config: GatewayConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn IdentityStore>,
    ) -> Self {
        let profile = BackendProfile::for_kind(config.backend);
        let url = config.resolved_url();
        let session_key = initial_session_key(&config);
        let correlator = Arc::new(RequestCorrelator::new());
        let aggregator = Arc::new(StreamingAggregator::new());
        let connection = Arc::new(ConnectionManager::new(
            connector,
            correlator.clone(),
            aggregator.clone(),
        ));

        info!(backend = %profile.kind, url = %url, session = %session_key, "Gateway client initialized");

        Self {
            config,
            profile,
            url,
            store,
            correlator,
            aggregator,
            connection,
            handshake: OnceCell::new(),
            session_key: RwLock::new(session_key),
            connects: AtomicU64::new(0),
            retry: RetryPolicy::connect_default(),
            ensure_lock: Mutex::new(()),
        }
    }

    /// WebSocket transport and the on-disk identity store.
    pub fn from_config(config: GatewayConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.accept_invalid_certs));
        let store = Arc::new(
            config
                .identity_dir
                .clone()
                .map(FileIdentityStore::new)
                .unwrap_or_default(),
        );
        Self::new(config, connector, store)
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn backend(&self) -> GatewayKind {
        self.profile.kind
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn session_key(&self) -> String {
        self.session_key
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_session_key(&self, key: String) {
        *self
            .session_key
            .write()
            .unwrap_or_else(PoisonError::into_inner) = key;
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.connection.subscribe()
    }

    /// Credentials are read once and reused across reconnects.
    async fn handshake(&self) -> Result<&Handshake> {
        self.handshake
            .get_or_try_init(|| async { self.build_handshake() })
            .await
    }

    fn build_handshake(&self) -> Result<Handshake> {
        let mut handshake = Handshake {
            profile: self.profile.clone(),
            auth: None,
            identity: None,
            signing_token: String::new(),
            timeout: self.config.handshake_timeout(),
        };

        if self.profile.uses_device_identity() {
            let identity = self.store.load_identity()?;
            let tokens = self.store.load_tokens(&identity.device_id)?;
            let token = tokens.auth_token().unwrap_or_default().to_string();
            if token.is_empty() {
                warn!(device_id = %identity.device_id, "No gateway or operator token found");
            } else {
                handshake.auth = Some(ConnectAuth::token(token.clone()));
            }
            handshake.signing_token = token;
            handshake.identity = Some(Arc::new(identity));
        } else {
            handshake.auth = self.config.api_key.clone().map(ConnectAuth::api_key);
        }
        Ok(handshake)
    }

    /// Connect and authenticate unless already connected.
    ///
    /// Concurrent callers serialize; only the first performs a handshake.
    /// After a connection loss the next call reconnects.
    #[instrument(skip(self), fields(backend = %self.profile.kind))]
    pub async fn ensure_connected(&self) -> Result<()> {
        let _guard = self.ensure_lock.lock().await;
        if self.connection.state() == ConnectionState::Authenticated {
            return Ok(());
        }

        let handshake = self.handshake().await?;
        let url = self.url.as_str();
        let connection = &self.connection;
        retry_with_backoff(
            &self.retry,
            move |_attempt| connection.connect(url, handshake),
            classify_connect_error,
            |retry| {
                warn!(
                    attempt = retry.attempt,
                    delay_ms = retry.delay.as_millis() as u64,
                    reason = retry.reason.as_str(),
                    "Retrying gateway connection"
                );
            },
        )
        .await?;

        let reconnect = self.connects.fetch_add(1, Ordering::SeqCst) > 0;
        if reconnect
            && self.config.session_key.is_none()
            && self.config.session_strategy.renews_on_connect()
            && self.profile.kind == GatewayKind::Moltis
        {
            let key = self
                .config
                .session_strategy
                .session_key(&self.config.agent_id, chrono::Local::now());
            debug!(session = %key, "Renewed session key for new connection");
            self.set_session_key(key);
        }

        if self.profile.switches_session_on_connect() {
            let key = self.session_key();
            match self.call("sessions.switch", params(&SessionSwitchParams { key: key.clone() })?).await {
                Ok(_) => info!(session = %key, "Session selected"),
                // The gateway stays usable on its default session.
                Err(e) => warn!(session = %key, error = %e, "Session switch failed"),
            }
        }
        Ok(())
    }

    /// Send one request and wait for its response.
    async fn call(&self, method: &str, params: Value) -> Result<ResponseFrame> {
        let id = self.correlator.next_id();
        let rx = self.correlator.register(&id).await;
        if let Err(e) = self
            .connection
            .send(&Envelope::request(id.as_str(), method, params))
            .await
        {
            self.correlator.forget(&id).await;
            return Err(e);
        }
        Ok(self
            .correlator
            .wait(&id, rx, self.config.request_timeout())
            .await?)
    }

    /// Send a prompt and wait for the agent's reply.
    ///
    /// Returns `Completed` with the reply text, `TimedOut` with the fallback
    /// text when nothing terminal arrives within the turn timeout, or
    /// `Cancelled` when [`cancel_pending`](Self::cancel_pending) or a newer
    /// prompt interrupts the turn.
    #[instrument(skip(self, text), fields(backend = %self.profile.kind))]
    pub async fn send_prompt(&self, text: &str) -> Result<TurnOutcome> {
        self.ensure_connected().await?;

        let prompt = if self.config.voice_tagging {
            format_voice_message(text)
        } else {
            text.to_string()
        };
        info!(prompt = %preview(text), "Sending prompt");

        let mut turn = self.aggregator.begin_turn().await;
        let turn_id = turn.turn_id;
        let id = self.correlator.next_id();
        self.aggregator.bind_request(turn_id, &id).await;
        let chat = self.profile.chat_send(&self.session_key(), prompt, &id);
        let mut ack = self.correlator.register(&id).await;

        let sent = match params(&chat) {
            Ok(p) => self.connection.send(&Envelope::request(id.as_str(), "chat.send", p)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.correlator.forget(&id).await;
            self.aggregator.finish_turn(turn_id, TurnOutcome::Cancelled).await;
            return Err(e);
        }

        let deadline = tokio::time::sleep(self.config.turn_timeout());
        tokio::pin!(deadline);
        let mut acked = false;

        let outcome = loop {
            tokio::select! {
                biased;
                ack_result = &mut ack, if !acked => {
                    acked = true;
                    match ack_result {
                        Ok(Ok(response)) => self.aggregator.on_response(turn_id, &response).await,
                        Ok(Err(CallError::Rejected { code, message })) => {
                            error!(error = %message, "chat.send rejected");
                            self.aggregator.finish_turn(turn_id, TurnOutcome::Cancelled).await;
                            return Err(CallError::Rejected { code, message }.into());
                        }
                        Ok(Err(CallError::ConnectionLost(reason))) => {
                            self.aggregator.finish_turn(turn_id, TurnOutcome::Cancelled).await;
                            return Err(GatewayError::ConnectionLost(reason));
                        }
                        Ok(Err(e)) => debug!(error = %e, "No ack for chat.send"),
                        Err(_) => debug!("Ack waiter dropped"),
                    }
                }
                outcome = &mut turn => break outcome,
                _ = &mut deadline => {
                    warn!(timeout_secs = self.config.turn_timeout_secs, "No reply within turn timeout");
                    let timed_out = TurnOutcome::TimedOut {
                        fallback: self.config.fallback_text.clone(),
                    };
                    self.aggregator.finish_turn(turn_id, timed_out.clone()).await;
                    break timed_out;
                }
            }
        };

        if !acked {
            self.correlator.forget(&id).await;
        }

        if outcome == TurnOutcome::Cancelled
            && self.connection.state() != ConnectionState::Authenticated
        {
            return Err(GatewayError::ConnectionLost(
                "connection lost during turn".into(),
            ));
        }
        if let TurnOutcome::Completed(reply) = &outcome {
            info!(reply = %preview(reply), "Agent replied");
        }
        Ok(outcome)
    }

    /// Run one pipeline turn: extract the latest user utterance, prompt the
    /// agent, and emit started / text / ended.
    ///
    /// Failures are logged and spoken as the fallback text; a cancelled turn
    /// emits no text.
    pub async fn respond(&self, transcript: &[TranscriptTurn], signals: &mpsc::Sender<ResponseSignal>) {
        let _ = signals.send(ResponseSignal::Started).await;

        match latest_user_utterance(transcript) {
            None => warn!("No user message found"),
            Some(utterance) => {
                let text = match self.send_prompt(&utterance).await {
                    Ok(TurnOutcome::Completed(reply)) if !reply.is_empty() => Some(reply),
                    Ok(TurnOutcome::Completed(_)) => Some(self.config.fallback_text.clone()),
                    Ok(TurnOutcome::TimedOut { fallback }) => Some(fallback),
                    Ok(TurnOutcome::Cancelled) => None,
                    Err(e) => {
                        error!(error = %e, "Gateway turn failed");
                        Some(self.config.fallback_text.clone())
                    }
                };
                if let Some(text) = text {
                    let _ = signals.send(ResponseSignal::Text(text)).await;
                }
            }
        }

        let _ = signals.send(ResponseSignal::Ended).await;
    }

    /// Drop the in-flight turn, if any. The connection stays open.
    pub async fn cancel_pending(&self) -> bool {
        let cancelled = self.aggregator.cancel().await;
        if cancelled {
            info!("Cancelled pending response");
        }
        cancelled
    }

    /// Point subsequent prompts at `key`.
    ///
    /// The session-keyed gateway is told via `sessions.switch`; the
    /// device-authenticated one names the session on every `chat.send`, so
    /// only the local key changes.
    pub async fn switch_session(&self, key: &str) -> Result<()> {
        if self.connection.state() != ConnectionState::Authenticated {
            return Err(GatewayError::NotConnected);
        }
        if self.profile.switches_session_on_connect() {
            self.call(
                "sessions.switch",
                params(&SessionSwitchParams {
                    key: key.to_string(),
                })?,
            )
            .await?;
        }
        self.set_session_key(key.to_string());
        info!(session = %key, "Switched session");
        self.connection.emit(ClientEvent::SessionSwitched {
            key: key.to_string(),
        });
        Ok(())
    }

    /// Sessions known to the gateway.
    pub async fn list_sessions(&self) -> Result<Vec<Value>> {
        self.ensure_connected().await?;
        let response = self.call("sessions.list", json!({})).await?;
        Ok(match response.result {
            Some(Value::Array(sessions)) => sessions,
            Some(Value::Object(mut obj)) => match obj.remove("sessions") {
                Some(Value::Array(sessions)) => sessions,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        })
    }

    pub async fn close(&self) {
        self.aggregator.cancel().await;
        self.connection.close().await;
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.connection.stop_reader();
    }
}

fn initial_session_key(config: &GatewayConfig) -> String {
    if let Some(key) = config.session_key.as_ref().filter(|k| !k.is_empty()) {
        return key.clone();
    }
    match config.backend {
        GatewayKind::OpenClaw => OPENCLAW_SESSION_KEY.to_string(),
        GatewayKind::Moltis => config
            .session_strategy
            .session_key(&config.agent_id, chrono::Local::now()),
    }
}

fn params<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| ProtocolError::Encode(e.to_string()).into())
}
