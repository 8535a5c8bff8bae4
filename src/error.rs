//! Error taxonomy for the gateway client.
//!
//! Hard failures (cannot reach or authenticate with the gateway) are errors.
//! A gateway that declines to answer, or a turn interrupted by the user, is
//! not: those are reported through [`crate::gateway::TurnOutcome`].

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure to establish an authenticated connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The transport could not be opened (refused, reset, DNS, TLS).
    #[error("gateway unreachable: {0}")]
    Unreachable(String),
    /// The gateway answered the `connect` request with `ok: false`.
    #[error("gateway rejected connection: {0}")]
    Rejected(String),
    /// The gateway broke the handshake: closed early or sent a bad challenge.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// No `connect` response within the handshake timeout.
    #[error("handshake timed out after {}s", .0.as_secs_f32())]
    HandshakeTimeout(Duration),
    /// Signing the challenge failed.
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

/// Failure to load or use the device identity.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("device identity not found at {}", .0.display())]
    Missing(PathBuf),
    #[error("unsupported identity version {0}")]
    UnsupportedVersion(u32),
    #[error("unsupported device key type: {0} (expected Ed25519)")]
    UnsupportedKeyType(String),
    #[error("malformed identity: {0}")]
    Malformed(String),
    #[error("device public key does not match the private key")]
    KeyMismatch,
}

/// Wire-level failure. Never fatal to an established connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Outcome of a single correlated request that did not produce a result.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("request rejected by gateway: {message}")]
    Rejected { code: Option<String>, message: String },
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("request timed out")]
    TimedOut,
}

/// Error surfaced by [`crate::gateway::GatewayClient`].
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("not connected to gateway")]
    NotConnected,
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
