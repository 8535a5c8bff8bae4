//! Message-oriented transport under the gateway connection.
//!
//! A [`Connector`] opens a socket and hands back a text-frame sink and
//! stream. The production connector speaks WebSocket; tests can plug in
//! anything that moves strings.

use super::tls::{self, CertPolicy};
use crate::error::ConnectError;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use std::pin::Pin;
use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("transport closed")]
    Closed,
}

/// Outbound half: one text frame per item.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half: one text frame per item; ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, url: &str) -> Result<(FrameSink, FrameStream), ConnectError>;
}

/// WebSocket connector (`ws://` and `wss://`).
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    cert_policy: CertPolicy,
}

impl WsConnector {
    pub fn new(cert_policy: CertPolicy) -> Self {
        Self { cert_policy }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &str) -> Result<(FrameSink, FrameStream), ConnectError> {
        let parsed = Url::parse(url)
            .map_err(|e| ConnectError::Unreachable(format!("invalid gateway url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConnectError::Unreachable(format!(
                "unsupported scheme '{}' (expected ws or wss)",
                parsed.scheme()
            )));
        }

        let connector = if tls::skip_verification(self.cert_policy, &parsed) {
            debug!(host = ?parsed.host_str(), "Skipping certificate verification");
            let config = tls::insecure_client_config()
                .map_err(|e| ConnectError::Unreachable(format!("TLS setup failed: {e}")))?;
            Some(tokio_tungstenite::Connector::Rustls(config))
        } else {
            None
        };

        let (ws, _response) =
            tokio_tungstenite::connect_async_tls_with_config(url, None, false, connector)
                .await
                .map_err(map_open_error)?;

        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(|e| TransportError::WebSocket(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text.into()))));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Gateway sent close frame");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// An HTTP 401/403 on upgrade is a rejection, not an outage.
fn map_open_error(err: tungstenite::Error) -> ConnectError {
    match &err {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            ConnectError::Rejected(format!("HTTP {}", response.status()))
        }
        _ => ConnectError::Unreachable(err.to_string()),
    }
}
