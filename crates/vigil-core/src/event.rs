use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

use crate::types::{JobId, ReplyTarget};
use crate::{Result, jsonl};

/// A signal flowing through the runtime. Immutable once published; the
/// serialized form is the audit log line schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    #[serde(default)]
    pub payload: Map<String, Value>,
    pub source: String,
    pub occurred_at: DateTime<Utc>,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InboundMessage,
    Timer,
    Sensor,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Normal,
    High,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::InboundMessage => "inbound_message",
            EventKind::Timer => "timer",
            EventKind::Sensor => "sensor",
            EventKind::System => "system",
        };
        f.write_str(s)
    }
}

impl Event {
    pub fn new(
        kind: EventKind,
        source: impl Into<String>,
        severity: Severity,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            source: source.into(),
            occurred_at: Utc::now(),
            severity,
        }
    }

    // ── Constructors per kind ──────────────────────────────────

    /// An operator message received over a channel.
    pub fn inbound_message(
        channel: &str,
        conversation_id: &str,
        message_id: &str,
        sender: &str,
        text: &str,
    ) -> Self {
        let mut payload = Map::new();
        payload.insert("channel".into(), channel.into());
        payload.insert("conversation_id".into(), conversation_id.into());
        payload.insert("message_id".into(), message_id.into());
        payload.insert("sender".into(), sender.into());
        payload.insert("text".into(), text.into());
        Self::new(EventKind::InboundMessage, channel, Severity::Normal, payload)
    }

    /// A scheduled job firing.
    pub fn timer(job_id: JobId, action: &str, reply_to: Option<&ReplyTarget>) -> Self {
        let mut payload = Map::new();
        payload.insert("job_id".into(), job_id.to_string().into());
        payload.insert("action".into(), action.into());
        if let Some(target) = reply_to {
            payload.insert("channel".into(), target.channel.clone().into());
            payload.insert("conversation_id".into(), target.conversation_id.clone().into());
        }
        Self::new(EventKind::Timer, "scheduler", Severity::Normal, payload)
    }

    /// A world-sensing observation.
    pub fn sensor(source: &str, severity: Severity, summary: &str, mut payload: Map<String, Value>) -> Self {
        payload.insert("text".into(), summary.into());
        Self::new(EventKind::Sensor, source, severity, payload)
    }

    /// A runtime diagnostic, identified by a dotted `code` such as `transport.send_failed`.
    pub fn system(source: &str, code: &str, detail: impl Into<String>, severity: Severity) -> Self {
        let mut payload = Map::new();
        payload.insert("code".into(), code.into());
        payload.insert("detail".into(), Value::String(detail.into()));
        Self::new(EventKind::System, source, severity, payload)
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    // ── Payload accessors ──────────────────────────────────────

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// The text the event asks the runtime to consider: message text,
    /// timer action, or sensor summary.
    pub fn text(&self) -> Option<&str> {
        match self.kind {
            EventKind::Timer => self.payload_str("action"),
            EventKind::System => self.payload_str("detail"),
            _ => self.payload_str("text"),
        }
    }

    pub fn code(&self) -> Option<&str> {
        self.payload_str("code")
    }

    pub fn reply_target(&self) -> Option<ReplyTarget> {
        Some(ReplyTarget::new(
            self.payload_str("channel")?,
            self.payload_str("conversation_id")?,
        ))
    }
}

// ── Audit log ──────────────────────────────────────────────────

/// Append-only record of every published event, one file per UTC day.
/// Written for replay and debugging; never read back into live dispatch.
pub struct AuditLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    pub fn append(&self, event: &Event) -> Result<()> {
        let _guard = self.write_lock.lock();
        jsonl::append(&self.file_for(event.occurred_at.date_naive()), event)
    }

    /// The most recent `limit` events across all days, oldest first.
    pub fn tail(&self, limit: usize) -> Result<Vec<Event>> {
        let mut files: Vec<PathBuf> = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|x| x == "jsonl"))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        files.sort();

        let mut collected: Vec<Event> = Vec::new();
        for file in files.iter().rev() {
            let mut day: Vec<Event> = jsonl::read_all(file)?;
            day.append(&mut collected);
            collected = day;
            if collected.len() >= limit {
                break;
            }
        }
        let skip = collected.len().saturating_sub(limit);
        Ok(collected.split_off(skip))
    }
}

// ── Event bus ──────────────────────────────────────────────────

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Predicate = dyn Fn(&Event) -> bool + Send + Sync;
type Handler = dyn Fn(&Event) -> Result<()> + Send + Sync;

struct Subscription {
    id: SubscriptionId,
    predicate: Box<Predicate>,
    handler: Box<Handler>,
}

struct BusInner {
    subscribers: RwLock<Vec<Arc<Subscription>>>,
    next_id: AtomicU64,
    audit: Option<AuditLog>,
}

/// In-process fan-out. `publish` writes the audit line, then runs every
/// matching handler on the caller's task, in subscription order, before it
/// returns. Handlers must be quick; anything slow belongs on a queue the
/// handler feeds.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(audit: AuditLog) -> Self {
        Self::build(Some(audit))
    }

    /// A bus without an audit log.
    pub fn in_memory() -> Self {
        Self::build(None)
    }

    fn build(audit: Option<AuditLog>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                audit,
            }),
        }
    }

    pub fn audit_log(&self) -> Option<&AuditLog> {
        self.inner.audit.as_ref()
    }

    pub fn subscribe<P, H>(&self, predicate: P, handler: H) -> SubscriptionId
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
        H: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscribers.write().push(Arc::new(Subscription {
            id,
            predicate: Box::new(predicate),
            handler: Box::new(handler),
        }));
        debug!(subscription = %id, "subscriber registered");
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.inner.subscribers.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    pub fn publish(&self, event: Event) {
        if let Some(audit) = &self.inner.audit
            && let Err(e) = audit.append(&event)
        {
            error!(event_id = %event.id, error = %e, "failed to append event to audit log");
        }

        // Dispatch over a snapshot so handlers may (un)subscribe or publish.
        let snapshot: Vec<Arc<Subscription>> = self.inner.subscribers.read().clone();
        for sub in snapshot {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                if (sub.predicate)(&event) {
                    (sub.handler)(&event)
                } else {
                    Ok(())
                }
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(subscription = %sub.id, event_id = %event.id, kind = %event.kind, error = %e, "event handler failed");
                }
                Err(payload) => {
                    error!(
                        subscription = %sub.id,
                        event_id = %event.id,
                        kind = %event.kind,
                        panic = %panic_message(payload.as_ref()),
                        "event handler panicked"
                    );
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
