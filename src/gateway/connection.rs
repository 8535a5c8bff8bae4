//! Socket ownership, handshake and the receive loop.
//!
//! ```text
//! Disconnected ─▶ Handshaking ─▶ [ChallengeIssued] ─▶ Authenticated ─▶ Closing ─▶ Disconnected
//!                      │                 │                  │
//!                      └──── error ──────┴──── loss ────────┴─────────────────────▶ Disconnected
//! ```
//!
//! `connect` and `close` are serialized by one lock, so a second `connect`
//! waits for the first to finish. After authentication a single reader task
//! dispatches `res` frames to the correlator and `event` frames to the
//! aggregator. When that task sees the socket die it marks the connection
//! `Disconnected`, fails everything in flight and emits one
//! [`ClientEvent::ConnectionLost`]. Reconnecting is left to the caller.

use super::aggregator::StreamingAggregator;
use super::backend::BackendProfile;
use super::correlator::RequestCorrelator;
use super::identity::{self, Identity};
use super::protocol::{self, ConnectAuth, Envelope};
use super::transport::{Connector, FrameSink, FrameStream};
use crate::error::{CallError, ConnectError, GatewayError};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    ChallengeIssued,
    Authenticated,
    Closing,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Handshaking => "handshaking",
            Self::ChallengeIssued => "challenge_issued",
            Self::Authenticated => "authenticated",
            Self::Closing => "closing",
        }
    }
}

/// Lifecycle notifications for observers of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected { url: String },
    /// The socket died underneath an authenticated connection.
    ConnectionLost { reason: String },
    SessionSwitched { key: String },
    Closed,
}

/// Everything `connect` needs to authenticate.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub profile: BackendProfile,
    /// Credential sent with every `connect` request.
    pub auth: Option<ConnectAuth>,
    /// Required to answer a `connect.challenge`.
    pub identity: Option<Arc<Identity>>,
    /// Token bound into the signed challenge payload.
    pub signing_token: String,
    pub timeout: Duration,
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    correlator: Arc<RequestCorrelator>,
    aggregator: Arc<StreamingAggregator>,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<Option<FrameSink>>,
    reader: std::sync::Mutex<Option<CancellationToken>>,
    generation: AtomicU64,
    events: broadcast::Sender<ClientEvent>,
    connect_lock: Mutex<()>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        correlator: Arc<RequestCorrelator>,
        aggregator: Arc<StreamingAggregator>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(32);
        Self {
            connector,
            correlator,
            aggregator,
            state,
            writer: Mutex::new(None),
            reader: std::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            events,
            connect_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = prev.as_str(), to = next.as_str(), "Connection state");
        }
    }

    /// Open and authenticate. No-op when already authenticated.
    #[instrument(skip(self, handshake), fields(backend = %handshake.profile.kind))]
    pub async fn connect(self: &Arc<Self>, url: &str, handshake: &Handshake) -> Result<(), ConnectError> {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Authenticated {
            return Ok(());
        }

        info!(url = %url, "Connecting to gateway");
        self.set_state(ConnectionState::Handshaking);

        let outcome = tokio::time::timeout(handshake.timeout, self.handshake(url, handshake)).await;
        let (sink, stream) = match outcome {
            Ok(Ok(halves)) => halves,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(error = %e, "Gateway connection failed");
                return Err(e);
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                warn!(timeout_secs = handshake.timeout.as_secs(), "Gateway handshake timed out");
                return Err(ConnectError::HandshakeTimeout(handshake.timeout));
            }
        };

        *self.writer.lock().await = Some(sink);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = CancellationToken::new();
        if let Some(old) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone())
        {
            old.cancel();
        }
        self.set_state(ConnectionState::Authenticated);
        self.spawn_reader(stream, token, generation);

        info!(url = %url, "Connected to gateway");
        self.emit(ClientEvent::Connected {
            url: url.to_string(),
        });
        Ok(())
    }

    async fn handshake(
        &self,
        url: &str,
        handshake: &Handshake,
    ) -> Result<(FrameSink, FrameStream), ConnectError> {
        let (mut sink, mut stream) = self.connector.open(url).await?;

        let mut pending_id = self.correlator.next_id();
        let params = handshake.profile.connect_params(handshake.auth.clone(), None);
        send_handshake_frame(&mut sink, &pending_id, params_value(&params)?).await?;

        let mut challenged = false;
        loop {
            let frame = match stream.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => return Err(ConnectError::Handshake(e.to_string())),
                None => {
                    return Err(ConnectError::Handshake(
                        "gateway closed the connection during handshake".into(),
                    ));
                }
            };

            let envelope = match protocol::decode(&frame) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "Discarding malformed frame during handshake");
                    continue;
                }
            };

            match envelope {
                Envelope::Event(event) if event.name == "connect.challenge" => {
                    if challenged {
                        return Err(ConnectError::Handshake("repeated connect challenge".into()));
                    }
                    challenged = true;

                    let nonce = event
                        .payload
                        .get("nonce")
                        .and_then(Value::as_str)
                        .filter(|n| !n.is_empty())
                        .ok_or_else(|| {
                            ConnectError::Handshake("connect challenge without nonce".into())
                        })?;
                    self.set_state(ConnectionState::ChallengeIssued);

                    let identity = handshake.identity.as_deref().ok_or_else(|| {
                        ConnectError::Handshake(
                            "gateway requires device authentication but no identity is configured"
                                .into(),
                        )
                    })?;
                    let claims = handshake.profile.claims(&handshake.signing_token, nonce);
                    let device = identity::sign_now(identity, &claims)?;
                    debug!(device_id = %device.id, "Answering connect challenge");

                    pending_id = self.correlator.next_id();
                    let params = handshake
                        .profile
                        .connect_params(handshake.auth.clone(), Some(device));
                    send_handshake_frame(&mut sink, &pending_id, params_value(&params)?).await?;
                }
                Envelope::Event(event) => {
                    debug!(event = %event.name, "Ignoring event during handshake");
                }
                Envelope::Response(res) if !res.ok => {
                    return Err(ConnectError::Rejected(res.error_message()));
                }
                Envelope::Response(res) if res.id == pending_id || res.id.is_empty() => {
                    return Ok((sink, stream));
                }
                Envelope::Response(res) => {
                    debug!(id = %res.id, "Ignoring stale response during handshake");
                }
                Envelope::Request(req) => {
                    debug!(method = %req.method, "Ignoring request during handshake");
                }
            }
        }
    }

    fn spawn_reader(self: &Arc<Self>, mut stream: FrameStream, token: CancellationToken, generation: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    frame = stream.next() => match frame {
                        Some(Ok(text)) => this.dispatch(&text).await,
                        Some(Err(e)) => break e.to_string(),
                        None => break "gateway closed the connection".to_string(),
                    },
                }
            };
            this.connection_lost(generation, reason).await;
        });
    }

    async fn dispatch(&self, frame: &str) {
        match protocol::decode(frame) {
            Ok(Envelope::Response(res)) => {
                self.aggregator.observe_response(&res).await;
                self.correlator.resolve(res).await;
            }
            Ok(Envelope::Event(event)) if event.name == "connect.challenge" => {
                debug!("Ignoring challenge on authenticated connection");
            }
            Ok(Envelope::Event(event)) => self.aggregator.on_event(&event).await,
            Ok(Envelope::Request(req)) => {
                debug!(method = %req.method, "Ignoring gateway-initiated request");
            }
            Err(e) => warn!(error = %e, "Discarding malformed frame"),
        }
    }

    async fn connection_lost(&self, generation: u64, reason: String) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let lost = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Authenticated {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if !lost {
            return;
        }

        warn!(reason = %reason, "Gateway connection lost");
        self.writer.lock().await.take();
        let failed = self
            .correlator
            .reject_all(CallError::ConnectionLost(reason.clone()))
            .await;
        if failed > 0 {
            debug!(failed, "Failed pending requests after connection loss");
        }
        self.aggregator.fail_active().await;
        self.emit(ClientEvent::ConnectionLost { reason });
    }

    /// Write one envelope. Fails with `NotConnected` unless authenticated.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), GatewayError> {
        if self.state() != ConnectionState::Authenticated {
            return Err(GatewayError::NotConnected);
        }
        let frame = protocol::encode(envelope)?;
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(GatewayError::NotConnected)?;
        debug!(frame = %envelope.label(), "Sending");
        sink.send(frame)
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }

    /// Close the connection. Safe to call repeatedly.
    pub async fn close(&self) {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        self.set_state(ConnectionState::Closing);
        self.stop_reader();

        if let Some(mut sink) = self.writer.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "Error closing gateway socket");
            }
        }
        self.correlator
            .reject_all(CallError::ConnectionLost("connection closed".into()))
            .await;
        self.aggregator.fail_active().await;

        self.set_state(ConnectionState::Disconnected);
        info!("Gateway connection closed");
        self.emit(ClientEvent::Closed);
    }

    /// Stop the reader task without waiting; used from `Drop`.
    pub(crate) fn stop_reader(&self) {
        if let Some(token) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}

fn params_value<T: serde::Serialize>(params: &T) -> Result<Value, ConnectError> {
    serde_json::to_value(params)
        .map_err(|e| ConnectError::Handshake(format!("failed to encode connect params: {e}")))
}

async fn send_handshake_frame(
    sink: &mut FrameSink,
    id: &str,
    params: Value,
) -> Result<(), ConnectError> {
    let frame = protocol::encode(&Envelope::request(id, "connect", params))
        .map_err(|e| ConnectError::Handshake(e.to_string()))?;
    sink.send(frame)
        .await
        .map_err(|e| ConnectError::Handshake(e.to_string()))
}
