//! Request id allocation and response routing.
//!
//! Every outbound `req` gets a fresh id; the caller registers a waiter under
//! that id before sending, and the receive loop resolves it when the matching
//! `res` arrives. Exactly one outcome is delivered per registered id.

use super::protocol::ResponseFrame;
use crate::error::CallError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, oneshot};
use tracing::debug;

pub type CallResult = Result<ResponseFrame, CallError>;

/// One in-flight request awaiting its response.
#[derive(Debug)]
pub struct PendingCall {
    pub id: String,
    pub created_at: Instant,
    tx: oneshot::Sender<CallResult>,
}

/// Receiver half handed back by [`RequestCorrelator::register`].
pub type CallReceiver = oneshot::Receiver<CallResult>;

#[derive(Debug)]
pub struct RequestCorrelator {
    counter: AtomicU64,
    pending: Mutex<HashMap<String, PendingCall>>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    /// Ids start just above the current wall clock in milliseconds.
    pub fn new() -> Self {
        let seed = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        Self::starting_at(seed)
    }

    pub fn starting_at(seed: u64) -> Self {
        Self {
            counter: AtomicU64::new(seed),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Next request id. Strictly increasing across all callers.
    pub fn next_id(&self) -> String {
        (self.counter.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Register a waiter for `id`. A second registration replaces the first,
    /// whose receiver then observes cancellation.
    pub async fn register(&self, id: &str) -> CallReceiver {
        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            id: id.to_string(),
            created_at: Instant::now(),
            tx,
        };
        if let Some(old) = self.pending.lock().await.insert(id.to_string(), call) {
            let _ = old.tx.send(Err(CallError::Cancelled));
        }
        rx
    }

    /// Deliver a response. Unknown ids are logged and dropped.
    pub async fn resolve(&self, response: ResponseFrame) {
        let Some(call) = self.pending.lock().await.remove(&response.id) else {
            debug!(id = %response.id, "Dropping response for unknown request id");
            return;
        };
        let outcome = if response.ok {
            Ok(response)
        } else {
            Err(CallError::Rejected {
                code: response.error.as_ref().and_then(|e| e.code.clone()),
                message: response.error_message(),
            })
        };
        debug!(id = %call.id, elapsed_ms = call.created_at.elapsed().as_millis() as u64, "Resolved request");
        let _ = call.tx.send(outcome);
    }

    /// Fail one pending call. Unknown ids are logged and dropped.
    pub async fn reject(&self, id: &str, error: CallError) {
        match self.pending.lock().await.remove(id) {
            Some(call) => {
                let _ = call.tx.send(Err(error));
            }
            None => debug!(id = %id, "Dropping rejection for unknown request id"),
        }
    }

    /// Fail every pending call, e.g. when the connection drops.
    pub async fn reject_all(&self, error: CallError) -> usize {
        let drained: Vec<PendingCall> = self.pending.lock().await.drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.tx.send(Err(error.clone()));
        }
        count
    }

    /// Remove a waiter without delivering anything (caller gave up).
    pub async fn forget(&self, id: &str) {
        self.pending.lock().await.remove(id);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Wait up to `timeout` for the outcome of a registered call.
    pub async fn wait(&self, id: &str, rx: CallReceiver, timeout: Duration) -> CallResult {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallError::Cancelled),
            Err(_) => {
                self.forget(id).await;
                Err(CallError::TimedOut)
            }
        }
    }
}
