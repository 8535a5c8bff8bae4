//! Reassembles streamed assistant replies into one text per turn.
//!
//! A turn starts when a prompt is sent and ends on the first terminal signal:
//!
//! - `chat` event with `state: "final"` (structured `message.content` parts
//!   win over the delta buffer)
//! - `agent` event on the `assistant` stream whose delta is empty after at
//!   least one non-empty delta
//! - a `res` for the turn's `chat.send` carrying a non-empty `result.response`
//!
//! At most one turn is active. Starting a new one cancels the previous
//! waiter, and events tagged with the `runId` of a finished turn are dropped.
//! A turn that ends before its `chat.send` is acked leaves its request id
//! behind; the late ack then retires the `runId` it reports.

use super::protocol::{EventFrame, ResponseFrame};
use crate::logging::preview;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

const RETIRED_RUNS: usize = 32;
const RETIRED_REQUESTS: usize = 32;

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed(String),
    /// No terminal signal in time; `fallback` is what to say instead.
    TimedOut { fallback: String },
    Cancelled,
}

/// Waiter for one turn. Resolves to `Cancelled` if the turn is dropped.
#[derive(Debug)]
pub struct TurnHandle {
    pub turn_id: u64,
    rx: oneshot::Receiver<TurnOutcome>,
}

impl Future for TurnHandle {
    type Output = TurnOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<TurnOutcome> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(TurnOutcome::Cancelled))
    }
}

#[derive(Debug)]
struct ActiveTurn {
    id: u64,
    buffer: String,
    saw_delta: bool,
    run_id: Option<String>,
    request_id: Option<String>,
    waiter: oneshot::Sender<TurnOutcome>,
}

#[derive(Debug, Default)]
struct State {
    active: Option<ActiveTurn>,
    next_turn: u64,
    retired_runs: VecDeque<String>,
    retired_requests: VecDeque<String>,
}

fn push_bounded(queue: &mut VecDeque<String>, cap: usize, value: String) {
    if queue.len() == cap {
        queue.pop_front();
    }
    queue.push_back(value);
}

impl State {
    fn retire_run(&mut self, run: &str) {
        if !self.retired_runs.iter().any(|r| r == run) {
            push_bounded(&mut self.retired_runs, RETIRED_RUNS, run.to_string());
        }
    }

    fn retire(&mut self, turn: &ActiveTurn) {
        match (&turn.run_id, &turn.request_id) {
            (Some(run), _) => self.retire_run(run),
            (None, Some(request)) => {
                push_bounded(&mut self.retired_requests, RETIRED_REQUESTS, request.clone())
            }
            (None, None) => {}
        }
    }

    fn finish(&mut self, outcome: TurnOutcome) -> bool {
        let Some(turn) = self.active.take() else {
            return false;
        };
        self.retire(&turn);
        let _ = turn.waiter.send(outcome);
        true
    }
}

#[derive(Debug, Default)]
pub struct StreamingAggregator {
    state: Mutex<State>,
}

impl StreamingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new turn, cancelling any unterminated one.
    pub async fn begin_turn(&self) -> TurnHandle {
        let mut state = self.state.lock().await;
        if let Some(old) = state.active.as_ref() {
            warn!(
                turn = old.id,
                buffered = old.buffer.len(),
                "Superseding unterminated turn"
            );
            state.finish(TurnOutcome::Cancelled);
        }

        state.next_turn += 1;
        let id = state.next_turn;
        let (tx, rx) = oneshot::channel();
        state.active = Some(ActiveTurn {
            id,
            buffer: String::new(),
            saw_delta: false,
            run_id: None,
            request_id: None,
            waiter: tx,
        });
        TurnHandle { turn_id: id, rx }
    }

    /// Tie the active turn (if it is `turn_id`) to its `chat.send` id.
    pub async fn bind_request(&self, turn_id: u64, request_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(turn) = state.active.as_mut().filter(|t| t.id == turn_id) {
            turn.request_id = Some(request_id.to_string());
        }
    }

    /// See every inbound `res`, including ones no caller waits for anymore.
    ///
    /// The active turn adopts the `runId` from its own `chat.send` ack. An
    /// ack for the `chat.send` of an already finished turn retires the
    /// `runId` it carries, so that run's events cannot reach a later turn.
    pub async fn observe_response(&self, response: &ResponseFrame) {
        let Some(run) = response
            .result
            .as_ref()
            .and_then(|r| r.get("runId"))
            .and_then(Value::as_str)
        else {
            return;
        };
        let mut state = self.state.lock().await;
        if let Some(turn) = state
            .active
            .as_mut()
            .filter(|t| t.request_id.as_deref() == Some(response.id.as_str()))
        {
            turn.run_id.get_or_insert_with(|| run.to_string());
            return;
        }
        if let Some(pos) = state.retired_requests.iter().position(|r| *r == response.id) {
            state.retired_requests.remove(pos);
            debug!(id = %response.id, run_id = %run, "Retiring run of finished turn");
            state.retire_run(run);
        }
    }

    pub async fn has_active_turn(&self) -> bool {
        self.state.lock().await.active.is_some()
    }

    /// Drop the active turn and its buffer; the waiter sees `Cancelled`.
    pub async fn cancel(&self) -> bool {
        let cancelled = self.state.lock().await.finish(TurnOutcome::Cancelled);
        if cancelled {
            debug!("Cancelled active turn");
        }
        cancelled
    }

    /// End the active turn (if it is `turn_id`) with `outcome`.
    pub async fn finish_turn(&self, turn_id: u64, outcome: TurnOutcome) -> bool {
        let mut state = self.state.lock().await;
        if state.active.as_ref().map(|t| t.id) != Some(turn_id) {
            return false;
        }
        state.finish(outcome)
    }

    /// Connection went away: whatever is in flight will never finish.
    pub async fn fail_active(&self) {
        if self.state.lock().await.finish(TurnOutcome::Cancelled) {
            debug!("Dropped active turn after connection loss");
        }
    }

    /// Feed one inbound event. Unrecognized events are ignored.
    pub async fn on_event(&self, event: &EventFrame) {
        match event.name.as_str() {
            "chat" => self.on_chat(&event.payload).await,
            "agent" => self.on_agent(&event.payload).await,
            "health" | "tick" => {}
            other => debug!(event = %other, "Ignoring event"),
        }
    }

    /// Feed the `res` for the turn's `chat.send`.
    ///
    /// Adopts the reported `runId` and completes the turn when the gateway
    /// answered inline with `result.response`. An empty ack keeps waiting.
    pub async fn on_response(&self, turn_id: u64, response: &ResponseFrame) {
        let Some(result) = response.result.as_ref() else {
            return;
        };
        let mut state = self.state.lock().await;
        let Some(turn) = state.active.as_mut().filter(|t| t.id == turn_id) else {
            return;
        };

        if let Some(run) = result.get("runId").and_then(Value::as_str) {
            turn.run_id.get_or_insert_with(|| run.to_string());
        }

        match result.get("response").and_then(Value::as_str) {
            Some(text) if !text.is_empty() => {
                info!(reply = %preview(text), "Got inline response");
                let text = text.to_string();
                state.finish(TurnOutcome::Completed(text));
            }
            _ => debug!(turn = turn_id, "Empty ack, waiting for chat events"),
        }
    }

    /// Returns the active turn if `payload` belongs to it.
    fn claim<'a>(state: &'a mut State, payload: &Value) -> Option<&'a mut ActiveTurn> {
        let run = payload.get("runId").and_then(Value::as_str);
        if let Some(run) = run {
            if state.retired_runs.iter().any(|r| r == run) {
                debug!(run_id = %run, "Dropping event for finished run");
                return None;
            }
        }
        let turn = state.active.as_mut()?;
        let own = turn.run_id.clone();
        match (run, own.as_deref()) {
            (Some(run), Some(own)) if run != own => {
                debug!(run_id = %run, "Dropping event for foreign run");
                None
            }
            (Some(run), None) => {
                turn.run_id = Some(run.to_string());
                Some(turn)
            }
            _ => Some(turn),
        }
    }

    async fn on_chat(&self, payload: &Value) {
        let mut state = self.state.lock().await;
        let Some(turn) = Self::claim(&mut state, payload) else {
            return;
        };

        match payload.get("state").and_then(Value::as_str) {
            Some("delta") => {
                if let Some(text) = payload.get("text").and_then(Value::as_str) {
                    turn.buffer.push_str(text);
                    turn.saw_delta |= !text.is_empty();
                }
            }
            Some("final") => {
                let message = payload.get("message");
                if message
                    .and_then(|m| m.get("role"))
                    .and_then(Value::as_str)
                    .is_some_and(|role| role != "assistant")
                {
                    debug!("Ignoring final message from non-assistant role");
                    return;
                }
                let text = message
                    .and_then(content_text)
                    .or_else(|| (!turn.buffer.is_empty()).then(|| turn.buffer.clone()))
                    .or_else(|| payload.get("text").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_default();
                if text.is_empty() {
                    warn!("Final chat event carried no text");
                } else {
                    info!(reply = %preview(&text), "Turn complete");
                }
                state.finish(TurnOutcome::Completed(text));
            }
            other => debug!(state = ?other, "Ignoring chat event"),
        }
    }

    async fn on_agent(&self, payload: &Value) {
        if payload.get("stream").and_then(Value::as_str) != Some("assistant") {
            return;
        }
        let Some(data) = payload.get("data") else {
            return;
        };

        let mut state = self.state.lock().await;
        let Some(turn) = Self::claim(&mut state, payload) else {
            return;
        };

        let delta = data.get("delta").and_then(Value::as_str).unwrap_or_default();
        if !delta.is_empty() {
            turn.buffer.push_str(delta);
            turn.saw_delta = true;
            return;
        }
        if turn.saw_delta {
            let text = std::mem::take(&mut turn.buffer);
            info!(reply = %preview(&text), "End of assistant stream");
            state.finish(TurnOutcome::Completed(text));
        }
    }
}

/// Concatenated `text` parts of a structured message, if it has content.
fn content_text(message: &Value) -> Option<String> {
    match message.get("content")? {
        Value::String(s) => Some(s.clone()),
        Value::Array(parts) => Some(
            parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect(),
        ),
        _ => None,
    }
}
