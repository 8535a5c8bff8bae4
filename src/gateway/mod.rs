//! WebSocket client for agent gateways.
//!
//! This module connects the voice pipeline to a remote agent gateway: it
//! owns the socket and handshake (including device challenge-response),
//! correlates requests with responses, and folds streamed events back into
//! one reply per turn.

pub mod aggregator;
pub mod backend;
pub mod client;
pub mod connection;
pub mod correlator;
pub mod identity;
pub mod protocol;
pub mod tls;
pub mod transport;

// Re-export public types
pub use aggregator::{StreamingAggregator, TurnHandle, TurnOutcome};
pub use backend::{BackendProfile, GatewayKind, SessionStrategy};
pub use client::{GatewayClient, ResponseSignal};
pub use connection::{ClientEvent, ConnectionManager, ConnectionState, Handshake};
pub use correlator::{PendingCall, RequestCorrelator};
pub use identity::{
    AuthClaims, DeviceKey, FileIdentityStore, Identity, IdentityStore, PairedTokens,
};
pub use protocol::{Envelope, EventFrame, RequestFrame, ResponseFrame};
pub use tls::CertPolicy;
pub use transport::{Connector, FrameSink, FrameStream, TransportError, WsConnector};
