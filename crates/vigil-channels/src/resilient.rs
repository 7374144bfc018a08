use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vigil_config::schema::TransportConfig;
use vigil_core::{Event, EventBus, Severity, jsonl};

use crate::adapter::*;
use crate::state::{ConnectionMachine, ConnectionState, Transition, TransportSignal};

/// Message ids remembered for de-duplication.
const SEEN_CAPACITY: usize = 2048;
/// Pause between stream reconnect attempts while still Streaming.
const STREAM_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Timing knobs for the supervisor and outbound sends.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub poll_interval: Duration,
    pub max_send_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub typing_timeout: Duration,
}

impl From<&TransportConfig> for TransportSettings {
    fn from(c: &TransportConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(c.poll_interval_ms),
            max_send_attempts: c.max_send_attempts.max(1),
            base_backoff: Duration::from_millis(c.base_backoff_ms),
            max_backoff: Duration::from_millis(c.max_backoff_ms),
            typing_timeout: Duration::from_millis(c.typing_timeout_ms),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

/// Exponential backoff with ±25% jitter, capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let exp = base_ms.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(max.as_millis() as u64).max(1);
    let spread = capped / 2;
    let jitter = if spread == 0 { 0 } else { rand::random::<u64>() % (spread + 1) };
    Duration::from_millis(capped - capped / 4 + jitter)
}

// ── De-duplication state ───────────────────────────────────────

/// Bounded FIFO set of recently published message ids.
#[derive(Debug, Default)]
struct SeenSet {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenSet {
    fn from_ids(ids: Vec<String>) -> Self {
        let mut set = Self::default();
        for id in ids {
            set.insert(id);
        }
        set
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Returns false if already present.
    fn insert(&mut self, id: String) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        if self.order.len() >= SEEN_CAPACITY
            && let Some(evicted) = self.order.pop_front()
        {
            self.ids.remove(&evicted);
        }
        self.ids.insert(id.clone());
        self.order.push_back(id);
        true
    }

    fn snapshot(&self) -> Vec<String> {
        self.order.iter().cloned().collect()
    }
}

/// On-disk form of `transport/cursor.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CursorFile {
    cursor: Option<String>,
    #[serde(default)]
    seen: Vec<String>,
}

struct Inbox {
    cursor: Option<String>,
    seen: SeenSet,
}

// ── Supervisor ─────────────────────────────────────────────────

/// Supervises a [`Transport`]: streams when it can, polls history when it
/// must, and publishes every operator message to the bus exactly once.
pub struct ResilientTransport {
    inner: Arc<dyn Transport>,
    bus: EventBus,
    settings: TransportSettings,
    machine: Mutex<ConnectionMachine>,
    state_tx: watch::Sender<ConnectionState>,
    inbox: Mutex<Inbox>,
    cursor_path: PathBuf,
}

impl ResilientTransport {
    pub fn new(
        inner: Arc<dyn Transport>,
        bus: EventBus,
        settings: TransportSettings,
        cursor_path: PathBuf,
    ) -> Self {
        let saved: CursorFile = match jsonl::read_json(&cursor_path) {
            Ok(Some(saved)) => saved,
            Ok(None) => CursorFile::default(),
            Err(e) => {
                warn!(path = %cursor_path.display(), error = %e, "unreadable transport cursor, starting fresh");
                CursorFile::default()
            }
        };
        debug!(cursor = ?saved.cursor, seen = saved.seen.len(), "transport cursor loaded");

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner,
            bus,
            settings,
            machine: Mutex::new(ConnectionMachine::new()),
            state_tx,
            inbox: Mutex::new(Inbox {
                cursor: saved.cursor,
                seen: SeenSet::from_ids(saved.seen),
            }),
            cursor_path,
        }
    }

    pub fn channel_name(&self) -> &str {
        self.inner.name()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_halted(&self) -> bool {
        self.machine.lock().is_halted()
    }

    pub fn cursor(&self) -> Option<String> {
        self.inbox.lock().cursor.clone()
    }

    // ── State changes ──────────────────────────────────────────

    fn signal(&self, signal: TransportSignal) {
        let transition = self.machine.lock().apply(signal);
        if let Some(t) = transition {
            self.on_transition(t);
        }
    }

    fn on_transition(&self, t: Transition) {
        self.state_tx.send_replace(t.to);
        let channel = self.inner.name();
        match (t.from, t.to) {
            (ConnectionState::Streaming | ConnectionState::Disconnected, ConnectionState::Degraded { .. }) => {
                warn!(channel, "stream unhealthy, falling back to history polling");
                self.bus.publish(
                    Event::system(
                        channel,
                        "transport.degraded",
                        format!("{} consecutive stream failures, polling history", crate::state::STREAM_FAILURE_THRESHOLD),
                        Severity::High,
                    )
                    .with_field("from", t.from.label()),
                );
            }
            (ConnectionState::Degraded { .. }, ConnectionState::Streaming) => {
                info!(channel, "stream recovered");
                self.bus.publish(Event::system(
                    channel,
                    "transport.recovered",
                    "live stream restored",
                    Severity::Normal,
                ));
            }
            (_, ConnectionState::Disconnected) => {
                // Only an auth failure leads back here.
                error!(channel, "transport halted after authentication failure");
            }
            (from, to) => debug!(channel, from = %from, to = %to, "transport state changed"),
        }
    }

    fn auth_failed(&self, reason: &str) {
        let already = self.is_halted();
        self.signal(TransportSignal::AuthFailed);
        if !already {
            self.bus.publish(Event::system(
                self.inner.name(),
                "transport.auth_failed",
                format!("{reason}; fix the credentials and restart the daemon"),
                Severity::High,
            ));
        }
    }

    // ── Inbound ────────────────────────────────────────────────

    /// Publish unseen messages in send order and advance the cursor.
    /// Returns how many were published.
    fn accept(&self, mut batch: Vec<InboundMessage>) -> usize {
        if batch.is_empty() {
            return 0;
        }
        let newest_in_transport_order = batch.last().map(|m| m.id.clone());
        batch.sort_by_key(|m| m.sent_at);

        let fresh: Vec<InboundMessage> = {
            let mut inbox = self.inbox.lock();
            let fresh = batch
                .into_iter()
                .filter(|m| inbox.seen.insert(m.id.clone()))
                .collect();
            if newest_in_transport_order.is_some() {
                inbox.cursor = newest_in_transport_order;
            }
            fresh
        };
        self.persist_cursor();

        for m in &fresh {
            debug!(channel = self.inner.name(), message_id = %m.id, "publishing inbound message");
            self.bus.publish(Event::inbound_message(
                self.inner.name(),
                &m.conversation_id,
                &m.id,
                &m.sender,
                &m.text,
            ));
        }
        fresh.len()
    }

    /// Whether a message id has already been published.
    pub fn has_seen(&self, id: &str) -> bool {
        self.inbox.lock().seen.contains(id)
    }

    fn persist_cursor(&self) {
        let file = {
            let inbox = self.inbox.lock();
            CursorFile {
                cursor: inbox.cursor.clone(),
                seen: inbox.seen.snapshot(),
            }
        };
        if let Err(e) = jsonl::write_json(&self.cursor_path, &file) {
            warn!(path = %self.cursor_path.display(), error = %e, "failed to persist transport cursor");
        }
    }

    /// After a (re)connect, fetch whatever arrived while the stream was down
    /// or the daemon was stopped. Only runs once a cursor exists, so a first
    /// start does not replay the relay's whole history. Returns false if
    /// cancelled.
    async fn catch_up(&self, cancel: &CancellationToken) -> bool {
        let Some(cursor) = self.cursor() else {
            return true;
        };
        let polled = tokio::select! {
            _ = cancel.cancelled() => return false,
            r = self.inner.poll_history_since(Some(&cursor)) => r,
        };
        match polled {
            Ok(batch) => {
                let published = self.accept(batch);
                if published > 0 {
                    info!(channel = self.inner.name(), published, "caught up on missed messages");
                }
            }
            Err(TransportError::Auth(reason)) => self.auth_failed(&reason),
            Err(TransportError::Transient(reason)) => {
                // The next outage poll or reconnect retries from the same cursor.
                warn!(channel = self.inner.name(), error = %reason, "catch-up poll failed");
            }
        }
        true
    }

    /// Run the supervisor until cancelled or halted by an auth failure.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(channel = self.inner.name(), "transport supervisor started");
        let mut stream: Option<mpsc::Receiver<StreamEvent>> = None;

        while !cancel.is_cancelled() {
            if self.is_halted() {
                break;
            }
            match self.state() {
                ConnectionState::Disconnected | ConnectionState::Streaming if stream.is_none() => {
                    let attempt = tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = self.inner.connect() => r,
                    };
                    match attempt {
                        Ok(rx) => {
                            info!(channel = self.inner.name(), "stream connected");
                            stream = Some(rx);
                            self.signal(TransportSignal::Connected);
                            if !self.catch_up(&cancel).await {
                                break;
                            }
                        }
                        Err(TransportError::Auth(reason)) => self.auth_failed(&reason),
                        Err(TransportError::Transient(reason)) => {
                            warn!(channel = self.inner.name(), error = %reason, "stream connect failed");
                            self.signal(TransportSignal::ConnectFailed);
                            let delay = backoff_delay(
                                self.machine.lock().stream_errors(),
                                STREAM_RETRY_DELAY,
                                self.settings.poll_interval,
                            );
                            if !sleep_or_cancel(delay, &cancel).await {
                                break;
                            }
                        }
                    }
                }

                ConnectionState::Disconnected | ConnectionState::Streaming => {
                    let Some(rx) = stream.as_mut() else { continue };
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        ev = rx.recv() => ev,
                    };
                    match next {
                        Some(StreamEvent::Message(msg)) => {
                            self.signal(TransportSignal::MessageReceived);
                            self.accept(vec![msg]);
                        }
                        Some(StreamEvent::Error(TransportError::Auth(reason))) => {
                            stream = None;
                            self.auth_failed(&reason);
                        }
                        Some(StreamEvent::Error(TransportError::Transient(reason))) => {
                            warn!(channel = self.inner.name(), error = %reason, "stream error");
                            stream = None;
                            self.signal(TransportSignal::StreamError);
                        }
                        None => {
                            warn!(channel = self.inner.name(), "stream closed");
                            stream = None;
                            self.signal(TransportSignal::StreamError);
                        }
                    }
                }

                ConnectionState::Degraded { .. } => {
                    if self.machine.lock().wants_stream_attempt() {
                        let attempt = tokio::select! {
                            _ = cancel.cancelled() => break,
                            r = self.inner.connect() => r,
                        };
                        match attempt {
                            Ok(rx) => {
                                stream = Some(rx);
                                self.signal(TransportSignal::Connected);
                                if !self.catch_up(&cancel).await {
                                    break;
                                }
                            }
                            Err(TransportError::Auth(reason)) => self.auth_failed(&reason),
                            Err(TransportError::Transient(reason)) => {
                                debug!(channel = self.inner.name(), error = %reason, "stream still down, staying degraded");
                                self.signal(TransportSignal::ConnectFailed);
                            }
                        }
                        continue;
                    }

                    if !sleep_or_cancel(self.settings.poll_interval, &cancel).await {
                        break;
                    }
                    let cursor = self.cursor();
                    let polled = tokio::select! {
                        _ = cancel.cancelled() => break,
                        r = self.inner.poll_history_since(cursor.as_deref()) => r,
                    };
                    match polled {
                        Ok(batch) => {
                            let published = self.accept(batch);
                            debug!(channel = self.inner.name(), published, "history poll succeeded");
                            self.signal(TransportSignal::PollSucceeded);
                        }
                        Err(TransportError::Auth(reason)) => self.auth_failed(&reason),
                        Err(TransportError::Transient(reason)) => {
                            warn!(channel = self.inner.name(), error = %reason, "history poll failed");
                            self.signal(TransportSignal::PollFailed);
                        }
                    }
                }

                ConnectionState::Reconnecting { consecutive_failures } => {
                    let delay = backoff_delay(
                        consecutive_failures,
                        self.settings.base_backoff,
                        self.settings.max_backoff,
                    );
                    if !sleep_or_cancel(delay, &cancel).await {
                        break;
                    }
                    self.signal(TransportSignal::BackoffElapsed);
                }
            }
        }

        self.persist_cursor();
        info!(channel = self.inner.name(), state = %self.state(), "transport supervisor stopped");
    }

    // ── Outbound ───────────────────────────────────────────────

    /// Send a reply with typing indication and bounded retries.
    ///
    /// Failure publishes `transport.send_failed` and is returned to the caller.
    pub async fn send_reply(&self, conversation_id: &str, text: &str) -> Result<DeliveryReceipt, TransportError> {
        if self.state() == ConnectionState::Disconnected {
            let err = TransportError::Transient(format!("{} is disconnected", self.inner.name()));
            self.send_failed(conversation_id, &err, 0);
            return Err(err);
        }

        self.typing(conversation_id, true).await;
        let result = self.send_with_retry(conversation_id, text).await;
        self.typing(conversation_id, false).await;

        match result {
            Ok(receipt) => Ok(receipt),
            Err((err, attempts)) => {
                self.send_failed(conversation_id, &err, attempts);
                Err(err)
            }
        }
    }

    async fn send_with_retry(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<DeliveryReceipt, (TransportError, u32)> {
        let max = self.settings.max_send_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.send(conversation_id, text).await {
                Ok(receipt) => {
                    debug!(channel = self.inner.name(), conversation_id, attempt, "reply delivered");
                    return Ok(receipt);
                }
                Err(TransportError::Auth(reason)) => {
                    self.auth_failed(&reason);
                    return Err((TransportError::Auth(reason), attempt));
                }
                Err(e) if attempt >= max => return Err((e, attempt)),
                Err(e) => {
                    let delay = backoff_delay(attempt - 1, self.settings.base_backoff, self.settings.max_backoff);
                    warn!(
                        channel = self.inner.name(),
                        attempt,
                        max,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "send failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Best-effort; never delays a reply by more than `typing_timeout`.
    async fn typing(&self, conversation_id: &str, on: bool) {
        match tokio::time::timeout(self.settings.typing_timeout, self.inner.set_typing(conversation_id, on)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(channel = self.inner.name(), on, error = %e, "typing indicator failed"),
            Err(_) => debug!(channel = self.inner.name(), on, "typing indicator timed out"),
        }
    }

    fn send_failed(&self, conversation_id: &str, err: &TransportError, attempts: u32) {
        error!(channel = self.inner.name(), conversation_id, attempts, error = %err, "reply could not be delivered");
        self.bus.publish(
            Event::system(self.inner.name(), "transport.send_failed", err.to_string(), Severity::High)
                .with_field("conversation_id", conversation_id)
                .with_field("attempts", attempts),
        );
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        let first = backoff_delay(0, base, max);
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));
        let capped = backoff_delay(10, base, max);
        assert!(capped >= Duration::from_millis(750) && capped <= Duration::from_millis(1250));
    }

    #[test]
    fn test_seen_set_evicts_oldest() {
        let mut seen = SeenSet::default();
        for i in 0..SEEN_CAPACITY + 1 {
            assert!(seen.insert(i.to_string()));
        }
        assert!(!seen.contains("0"));
        assert!(seen.contains("1"));
        assert!(!seen.insert("1".into()));
        assert_eq!(seen.snapshot().len(), SEEN_CAPACITY);
    }
}
