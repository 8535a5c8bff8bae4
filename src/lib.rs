//! Agent gateway client for the talky voice pipeline.
//!
//! Connects to a Moltis (session-keyed) or OpenClaw (device-authenticated)
//! gateway over WebSocket and turns transcribed speech into agent replies.

pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod retry;
pub mod voice;

pub use error::{CallError, ConnectError, GatewayError, IdentityError, ProtocolError};
pub use gateway::{GatewayClient, GatewayKind, ResponseSignal, TurnOutcome};
