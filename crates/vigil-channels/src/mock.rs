//! Scripted transport for deterministic tests.
//!
//! Behaves like a relay with retained history: every message pushed onto the
//! live stream is also kept in history, and messages can be added to history
//! alone to simulate traffic that arrived while the stream was down.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::adapter::*;

pub struct ScriptedTransport {
    name: String,
    stream_tx: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    /// Errors returned by upcoming `connect` calls, one per call.
    connect_errors: Mutex<VecDeque<TransportError>>,
    /// Returned by every `connect` once the queue is empty.
    persistent_connect_error: Mutex<Option<TransportError>>,
    history: Mutex<Vec<InboundMessage>>,
    poll_errors: Mutex<VecDeque<TransportError>>,
    send_errors: Mutex<VecDeque<TransportError>>,
    sent: Mutex<Vec<(String, String)>>,
    typing: Mutex<Vec<(String, bool)>>,
    typing_delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
    polls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stream_tx: Mutex::new(None),
            connect_errors: Mutex::new(VecDeque::new()),
            persistent_connect_error: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            poll_errors: Mutex::new(VecDeque::new()),
            send_errors: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            typing: Mutex::new(Vec::new()),
            typing_delay: Mutex::new(None),
            connects: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }

    /// Build an inbound message.
    pub fn message(id: &str, conversation_id: &str, sender: &str, text: &str, sent_at: DateTime<Utc>) -> InboundMessage {
        InboundMessage {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender: sender.to_string(),
            text: text.to_string(),
            sent_at,
        }
    }

    // ── Scripting ──────────────────────────────────────────────

    pub fn queue_connect_error(&self, err: TransportError) {
        self.connect_errors.lock().push_back(err);
    }

    /// Make every connect fail until [`Self::allow_connects`].
    pub fn refuse_connects(&self, err: TransportError) {
        *self.persistent_connect_error.lock() = Some(err);
    }

    pub fn allow_connects(&self) {
        *self.persistent_connect_error.lock() = None;
    }

    pub fn queue_poll_error(&self, err: TransportError) {
        self.poll_errors.lock().push_back(err);
    }

    pub fn queue_send_error(&self, err: TransportError) {
        self.send_errors.lock().push_back(err);
    }

    pub fn set_typing_delay(&self, delay: Duration) {
        *self.typing_delay.lock() = Some(delay);
    }

    /// Deliver over the live stream (and record in history).
    /// Returns false if no stream is open.
    pub async fn push_stream(&self, msg: InboundMessage) -> bool {
        self.history.lock().push(msg.clone());
        let tx = self.stream_tx.lock().clone();
        match tx {
            Some(tx) => tx.send(StreamEvent::Message(msg)).await.is_ok(),
            None => false,
        }
    }

    /// Add to history only, as if it arrived while the stream was down.
    pub fn add_history(&self, msg: InboundMessage) {
        self.history.lock().push(msg);
    }

    /// Fail the open stream with `err`.
    pub async fn break_stream(&self, err: TransportError) {
        let tx = self.stream_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(StreamEvent::Error(err)).await;
        }
    }

    /// Drop the open stream without an error.
    pub fn close_stream(&self) {
        self.stream_tx.lock().take();
    }

    // ── Inspection ─────────────────────────────────────────────

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    pub fn typing_calls(&self) -> Vec<(String, bool)> {
        self.typing.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<mpsc::Receiver<StreamEvent>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.connect_errors.lock().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.persistent_connect_error.lock().clone() {
            return Err(err);
        }
        let (tx, rx) = mpsc::channel(64);
        *self.stream_tx.lock() = Some(tx);
        Ok(rx)
    }

    async fn send(&self, conversation_id: &str, text: &str) -> Result<DeliveryReceipt, TransportError> {
        if let Some(err) = self.send_errors.lock().pop_front() {
            return Err(err);
        }
        let mut sent = self.sent.lock();
        sent.push((conversation_id.to_string(), text.to_string()));
        Ok(DeliveryReceipt::new(Some(format!("out-{}", sent.len()))))
    }

    async fn poll_history_since(&self, cursor: Option<&str>) -> Result<Vec<InboundMessage>, TransportError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.poll_errors.lock().pop_front() {
            return Err(err);
        }
        let history = self.history.lock();
        let start = cursor
            .and_then(|c| history.iter().position(|m| m.id == c))
            .map(|i| i + 1)
            .unwrap_or(0);
        Ok(history[start..].to_vec())
    }

    async fn set_typing(&self, conversation_id: &str, on: bool) -> Result<(), TransportError> {
        let delay = *self.typing_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.typing.lock().push((conversation_id.to_string(), on));
        Ok(())
    }
}
