//! # Cognition
//!
//! Decides how much thinking each event deserves and produces the reply.
//!
//! ```text
//!  bus ──filter──▶ queue ──▶ dispatcher ──▶ lane(session A) ──▶ worker
//!                                      └──▶ lane(session B) ──▶ worker
//!
//!  per event:  Received → Triaged → FastPath | DeepPath → Completed
//! ```
//!
//! The bus handler never blocks: it clones matching events into a bounded
//! queue. The dispatcher fans them out to one lane per session so a slow
//! deep-path call in one conversation never holds up another, while events
//! of the same session are handled strictly in arrival order.

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vigil_channels::ConnectionState;
use vigil_config::VigilConfig;
use vigil_config::schema::LifeStage;
use vigil_core::{
    Event, EventKind, LOCAL_CHANNEL, Message, ReplyTarget, Result, Severity, SubscriptionId, VigilError,
};
use vigil_llm::{InferenceProvider, PromptContext, ProviderChain, RetryPolicy, ThinkingLevel};

use crate::commands::{Command, HELP_TEXT};
use crate::context::RuntimeContext;
use crate::identity;

/// Events buffered per session lane before new ones are dropped.
pub const LANE_CAPACITY: usize = 32;

/// A lane with nothing dispatched for this long is shut down.
pub const LANE_IDLE: Duration = Duration::from_secs(600);

static DEEP_REQUEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(^\s*/deep\b|^\s*deep:|\bthink\s+(?:deeply|hard)\b|\btake\s+your\s+time\b)")
        .expect("static regex")
});
static DEEP_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(?:/deep\b|deep:)\s*").expect("static regex"));
static SENSITIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(identity|imprint\w*|operator|permissions?|grant|revoke|config\w*|settings?|credentials?|passwords?|api[\s_-]?keys?)\b",
    )
    .expect("static regex")
});
static GREETING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(hi|hello|hey|good\s+(morning|afternoon|evening))\b").expect("static regex"));

/// Where replies go. The daemon routes `local` to the console and everything
/// else through the transport.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn deliver(&self, target: &ReplyTarget, text: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CognitionPath {
    Command,
    Fast,
    Deep,
}

impl CognitionPath {
    pub fn as_str(self) -> &'static str {
        match self {
            CognitionPath::Command => "command",
            CognitionPath::Fast => "fast",
            CognitionPath::Deep => "deep",
        }
    }
}

impl std::fmt::Display for CognitionPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one event.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub path: CognitionPath,
    pub reply: String,
    pub target: Option<ReplyTarget>,
    /// Provider that produced the reply; `None` for commands and canned replies.
    pub provider: Option<String>,
    /// Whether the exchange was appended to the session transcript.
    pub stored: bool,
}

#[derive(Debug, Clone)]
pub struct CognitionSettings {
    pub fast_timeout: Duration,
    pub deep_timeout: Duration,
    pub fast_context_turns: usize,
    pub max_turns: usize,
    pub max_chars: usize,
    pub system_prompt: Option<String>,
    pub life_stage: LifeStage,
    pub queue_capacity: usize,
    /// Reply target for timer and sensor events that carry none.
    pub operator_target: Option<ReplyTarget>,
    pub lane_idle: Duration,
}

impl From<&VigilConfig> for CognitionSettings {
    fn from(config: &VigilConfig) -> Self {
        Self {
            fast_timeout: Duration::from_millis(config.cognition.fast_timeout_ms),
            deep_timeout: Duration::from_millis(config.cognition.deep_timeout_ms),
            fast_context_turns: config.cognition.fast_context_turns,
            max_turns: config.session.max_turns,
            max_chars: config.session.max_chars,
            system_prompt: config.cognition.system_prompt.clone(),
            life_stage: config.runtime.life_stage,
            queue_capacity: config.cognition.queue_capacity.max(1),
            operator_target: config.runtime.operator_target(),
            lane_idle: LANE_IDLE,
        }
    }
}

/// Per-provider attempt budget from `[cognition]`.
pub fn retry_policy(config: &VigilConfig) -> RetryPolicy {
    RetryPolicy {
        attempt_timeout: Duration::from_millis(config.cognition.provider_timeout_ms),
        retries: config.cognition.provider_retries,
        ..RetryPolicy::default()
    }
}

/// Build the provider chain described by `[[providers]]`.
pub fn chain_from_config(config: &VigilConfig) -> Result<ProviderChain> {
    let mut chain = ProviderChain::new(retry_policy(config));
    for provider in &config.providers {
        chain.push(vigil_llm::build_provider(provider)?);
    }
    Ok(chain)
}

struct Triage {
    path: CognitionPath,
    reason: &'static str,
    sensitive: bool,
}

pub struct CognitionScheduler {
    settings: CognitionSettings,
    chain: ProviderChain,
    ctx: Arc<RuntimeContext>,
    sink: Arc<dyn ReplySink>,
    transport_state: Option<watch::Receiver<ConnectionState>>,
    active_lanes: AtomicUsize,
}

struct Lane {
    tx: mpsc::Sender<Event>,
    last_dispatch: Instant,
}

impl CognitionScheduler {
    pub fn new(ctx: Arc<RuntimeContext>, chain: ProviderChain, sink: Arc<dyn ReplySink>) -> Self {
        Self {
            settings: CognitionSettings::from(&ctx.config),
            chain,
            ctx,
            sink,
            transport_state: None,
            active_lanes: AtomicUsize::new(0),
        }
    }

    pub fn with_settings(mut self, settings: CognitionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Read-only view of the transport's connection state, for `status`.
    pub fn with_transport_state(mut self, state: watch::Receiver<ConnectionState>) -> Self {
        self.transport_state = Some(state);
        self
    }

    pub fn settings(&self) -> &CognitionSettings {
        &self.settings
    }

    pub fn chain(&self) -> &ProviderChain {
        &self.chain
    }

    /// Session lanes the dispatcher currently keeps open.
    pub fn active_lanes(&self) -> usize {
        self.active_lanes.load(Ordering::Relaxed)
    }

    // ── Intake ─────────────────────────────────────────────────

    /// Subscribe to the bus. Matching events are copied into a bounded
    /// queue; a full queue drops the event and logs it.
    pub fn attach(&self) -> (SubscriptionId, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(self.settings.queue_capacity);
        let id = self.ctx.bus.subscribe(
            |event| {
                matches!(
                    event.kind,
                    EventKind::InboundMessage | EventKind::Timer | EventKind::Sensor
                )
            },
            move |event| {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        error!(event_id = %event.id, kind = %event.kind, "cognition queue full; event dropped");
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(event_id = %event.id, "cognition stopped; event ignored");
                    }
                }
                Ok(())
            },
        );
        (id, rx)
    }

    /// Route queued events into per-session lanes until cancelled. Lanes
    /// idle for longer than `lane_idle` are closed; their worker drains and
    /// exits, and the next event for that session opens a fresh lane.
    pub async fn run(self: Arc<Self>, mut queue: mpsc::Receiver<Event>, cancel: CancellationToken) {
        let mut lanes: HashMap<String, Lane> = HashMap::new();
        let mut workers = JoinSet::new();
        let mut reap = tokio::time::interval((self.settings.lane_idle / 2).max(Duration::from_millis(10)));
        reap.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = reap.tick() => {
                    self.reap_lanes(&mut lanes);
                    continue;
                }
                next = queue.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };

            while let Some(joined) = workers.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "cognition lane worker failed");
                }
            }

            let lane = lane_key(&event);
            debug!(event_id = %event.id, stage = "received", lane = %lane);

            let mut pending = Some(event);
            for _ in 0..2 {
                let Some(event) = pending.take() else { break };
                let entry = lanes.entry(lane.clone()).or_insert_with(|| {
                    let (tx, rx) = mpsc::channel(LANE_CAPACITY);
                    workers.spawn(Arc::clone(&self).lane_worker(lane.clone(), rx, cancel.clone()));
                    Lane {
                        tx,
                        last_dispatch: Instant::now(),
                    }
                });
                entry.last_dispatch = Instant::now();
                match entry.tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(event)) => {
                        error!(event_id = %event.id, lane = %lane, "session lane full; event dropped");
                    }
                    Err(TrySendError::Closed(event)) => {
                        // The worker died; start a fresh one and retry once.
                        lanes.remove(&lane);
                        pending = Some(event);
                    }
                }
            }
            self.active_lanes.store(lanes.len(), Ordering::Relaxed);
        }

        drop(lanes);
        self.active_lanes.store(0, Ordering::Relaxed);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "cognition lane worker failed");
            }
        }
        info!("cognition dispatcher stopped");
    }

    fn reap_lanes(&self, lanes: &mut HashMap<String, Lane>) {
        let idle = self.settings.lane_idle;
        lanes.retain(|lane, entry| {
            let keep = entry.last_dispatch.elapsed() < idle && !entry.tx.is_closed();
            if !keep {
                debug!(lane = %lane, "closing idle cognition lane");
            }
            keep
        });
        self.active_lanes.store(lanes.len(), Ordering::Relaxed);
    }

    async fn lane_worker(self: Arc<Self>, lane: String, mut rx: mpsc::Receiver<Event>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.handle(&event) => {}
            }
        }
        debug!(lane = %lane, "cognition lane stopped");
    }

    // ── Per-event pipeline ─────────────────────────────────────

    /// Process, deliver, and announce one event. Never fails; every problem
    /// ends up in the reply or the log.
    pub async fn handle(&self, event: &Event) -> Outcome {
        let outcome = self.process(event).await;

        match &outcome.target {
            Some(target) => {
                if let Err(e) = self.sink.deliver(target, &outcome.reply).await {
                    warn!(event_id = %event.id, channel = %target.channel, error = %e, "reply delivery failed");
                }
            }
            None => info!(event_id = %event.id, reply = %outcome.reply, "no reply target; reply logged only"),
        }

        let mut completed = Event::system(
            "cognition",
            "cognition.completed",
            format!("{} handled via {} path", event.kind, outcome.path),
            Severity::Low,
        )
        .with_field("event_id", event.id.to_string())
        .with_field("path", outcome.path.as_str())
        .with_field("stored", outcome.stored);
        if let Some(provider) = &outcome.provider {
            completed = completed.with_field("provider", provider.as_str());
        }
        self.ctx.bus.publish(completed);
        debug!(event_id = %event.id, stage = "completed", path = %outcome.path);
        outcome
    }

    /// Decide, think, and record. Delivery is left to [`Self::handle`].
    pub async fn process(&self, event: &Event) -> Outcome {
        let text = event.text().unwrap_or_default().trim().to_string();
        let conversational = event.kind == EventKind::InboundMessage;
        let target = event
            .reply_target()
            .or_else(|| (!conversational).then(|| self.settings.operator_target.clone()).flatten());

        if matches!(event.kind, EventKind::InboundMessage | EventKind::Timer)
            && let Some(command) = Command::parse(&text)
        {
            debug!(event_id = %event.id, stage = "triaged", path = "command", command = command.name());
            let refusal = if conversational && command.is_operator_only() {
                self.operator_gate(event)
            } else {
                None
            };
            let reply = match refusal {
                Some(refusal) => refusal,
                None => self.run_command(command, target.as_ref()).await,
            };
            self.ctx.affect.lock().apply_severity(event.severity);
            return Outcome {
                path: CognitionPath::Command,
                reply,
                target,
                provider: None,
                stored: false,
            };
        }

        let triage = self.triage(event, &text);
        debug!(event_id = %event.id, stage = "triaged", path = %triage.path, reason = triage.reason);

        if triage.sensitive
            && conversational
            && let Some(refusal) = self.operator_gate(event)
        {
            self.ctx.affect.lock().apply_severity(event.severity);
            return Outcome {
                path: triage.path,
                reply: refusal,
                target,
                provider: None,
                stored: false,
            };
        }

        let prompt = prompt_for(event, &text);
        let session_key = target.as_ref().map(ReplyTarget::session_key);
        let history_key = if conversational { session_key.as_deref() } else { None };

        let (reply, provider) = match triage.path {
            CognitionPath::Deep => {
                debug!(event_id = %event.id, stage = "deep_path");
                self.deep_path(&prompt, history_key).await
            }
            _ => {
                debug!(event_id = %event.id, stage = "fast_path");
                self.fast_path(&prompt, history_key).await
            }
        };

        let stored = match (conversational, session_key.as_deref()) {
            (true, Some(key)) => self.store_exchange(key, &text, &reply),
            _ => false,
        };
        self.ctx.affect.lock().apply_severity(event.severity);

        Outcome {
            path: triage.path,
            reply,
            target,
            provider,
            stored,
        }
    }

    fn triage(&self, event: &Event, text: &str) -> Triage {
        let sensitive = SENSITIVE_RE.is_match(text);
        let words = text.split_whitespace().count();
        let reason = if event.severity == Severity::High {
            Some("high severity")
        } else if DEEP_REQUEST_RE.is_match(text) {
            Some("deep work requested")
        } else if sensitive {
            Some("identity, config, or permission request")
        } else if words >= self.settings.life_stage.deep_word_threshold() {
            Some("long message")
        } else {
            None
        };
        match reason {
            Some(reason) => Triage {
                path: CognitionPath::Deep,
                reason,
                sensitive,
            },
            None => Triage {
                path: CognitionPath::Fast,
                reason: "routine",
                sensitive,
            },
        }
    }

    /// `Some(refusal)` when the sender may not make operator-only requests.
    fn operator_gate(&self, event: &Event) -> Option<String> {
        let channel = event.payload_str("channel").unwrap_or_default();
        let sender = event.payload_str("sender").unwrap_or_default();
        if channel == LOCAL_CHANNEL {
            return None;
        }
        match &self.ctx.identity {
            None => Some(format!(
                "I can't act on operator-only requests yet: {}.",
                identity::missing_identity()
            )),
            Some(operator) if operator.authorizes(channel, sender) => None,
            Some(_) => {
                warn!(event_id = %event.id, channel, sender, "refused operator-only request");
                Some("Only my operator can do that.".into())
            }
        }
    }

    async fn fast_path(&self, prompt: &str, history_key: Option<&str>) -> (String, Option<String>) {
        let history = self.history(history_key, self.settings.fast_context_turns, self.settings.max_chars);
        self.infer(prompt, history, ThinkingLevel::Low, self.settings.fast_timeout, CognitionPath::Fast)
            .await
    }

    async fn deep_path(&self, prompt: &str, history_key: Option<&str>) -> (String, Option<String>) {
        let (turns, chars, factor) = {
            let affect = self.ctx.affect.lock();
            (
                affect.scale(self.settings.max_turns),
                affect.scale(self.settings.max_chars),
                affect.context_factor(),
            )
        };
        debug!(context_turns = turns, context_chars = chars, factor, "deep path context");
        let history = self.history(history_key, turns, chars);
        self.infer(prompt, history, ThinkingLevel::High, self.settings.deep_timeout, CognitionPath::Deep)
            .await
    }

    /// One bounded inference call. A result arriving after `budget` is dropped.
    async fn infer(
        &self,
        prompt: &str,
        history: Vec<Message>,
        thinking: ThinkingLevel,
        budget: Duration,
        path: CognitionPath,
    ) -> (String, Option<String>) {
        if self.chain.is_empty() {
            return (canned_reply(prompt, "no inference providers configured"), None);
        }
        let ctx = PromptContext::new(prompt)
            .with_system(self.settings.system_prompt.clone())
            .with_history(history);
        // The chain spreads the budget over its providers; the outer timeout
        // is the hard stop.
        match tokio::time::timeout(budget, self.chain.complete_within(&ctx, thinking, budget)).await {
            Ok(Ok(completion)) => (completion.text, Some(completion.provider)),
            Ok(Err(err)) => {
                warn!(path = %path, reason = %err, "inference failed");
                (canned_reply(prompt, &err.to_string()), None)
            }
            Err(_) => {
                let reason = format!("{path} path timed out after {}ms", budget.as_millis());
                warn!(path = %path, reason = %reason, "inference timed out");
                (canned_reply(prompt, &reason), None)
            }
        }
    }

    fn history(&self, key: Option<&str>, turns: usize, chars: usize) -> Vec<Message> {
        let Some(key) = key else { return Vec::new() };
        self.ctx.sessions.recent(key, turns, chars).unwrap_or_else(|e| {
            warn!(session = key, error = %e, "failed to read session history");
            Vec::new()
        })
    }

    fn store_exchange(&self, key: &str, text: &str, reply: &str) -> bool {
        match self
            .ctx
            .sessions
            .append_exchange(key, Message::user(text), Message::assistant(reply))
        {
            Ok(()) => true,
            Err(e) => {
                error!(session = key, error = %e, "failed to store exchange");
                false
            }
        }
    }

    // ── Commands ───────────────────────────────────────────────

    async fn run_command(&self, command: Command, target: Option<&ReplyTarget>) -> String {
        match command {
            Command::Status => self.status_report().await,
            Command::Doctor => self.doctor_report().await,
            Command::Help => HELP_TEXT.to_string(),
            Command::Jobs => self.jobs_report().await,
            Command::Schedule(phrase) => match self.ctx.scheduler.add(&phrase, target.cloned()).await {
                Ok(job) => format!(
                    "Scheduled {} ({}): {}. Next run {}.",
                    job.short_id(),
                    job.schedule.recurrence,
                    job.action(),
                    format_run(job.next_run_at)
                ),
                Err(VigilError::Schedule(reason)) => format!("Couldn't schedule that: {reason}."),
                Err(e) => format!("Couldn't schedule that: {e}."),
            },
            Command::Unschedule(id) => match self.ctx.scheduler.remove(&id).await {
                Ok(job) => format!("Removed job {}: {}.", job.short_id(), job.action()),
                Err(VigilError::Schedule(reason)) => format!("Couldn't unschedule: {reason}."),
                Err(e) => format!("Couldn't unschedule: {e}."),
            },
            Command::NewSession => {
                let Some(target) = target else {
                    return "There is no conversation to reset here.".into();
                };
                match self.ctx.sessions.archive(&target.session_key()) {
                    Ok(Some(_)) => "Started a new session. The previous transcript was archived.".into(),
                    Ok(None) => "Started a new session.".into(),
                    Err(e) => format!("Couldn't archive the session: {e}."),
                }
            }
        }
    }

    fn transport_label(&self) -> String {
        match &self.transport_state {
            Some(state) => state.borrow().to_string(),
            None => "console only".into(),
        }
    }

    async fn status_report(&self) -> String {
        let transport = self.transport_label();
        let uptime = format_uptime(Utc::now() - self.ctx.started_at);
        let (snapshot, factor) = {
            let affect = self.ctx.affect.lock();
            (affect.snapshot(), affect.context_factor())
        };
        let jobs = self.ctx.scheduler.len().await;
        format!(
            "Status\n  transport: {transport}\n  uptime: {uptime}\n  affect: {snapshot} (context x{factor:.2})\n  life stage: {}\n  jobs: {jobs}",
            self.settings.life_stage
        )
    }

    async fn doctor_report(&self) -> String {
        let operator = match &self.ctx.identity {
            Some(identity) => format!(
                "{} (imprinted {})",
                identity.operator_id,
                identity.imprinted_at.format("%Y-%m-%d")
            ),
            None => format!("missing: {}", identity::missing_identity()),
        };
        let providers = if self.chain.is_empty() {
            "none configured (canned replies only)".to_string()
        } else {
            self.chain
                .providers()
                .iter()
                .map(|p| {
                    if self.chain.is_tripped(p.name()) {
                        format!("{} (circuit open)", p.name())
                    } else {
                        p.name().to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        let transport = self.transport_label();
        let jobs = self.ctx.scheduler.len().await;
        format!(
            "Doctor\n  operator: {operator}\n  providers: {providers}\n  transport: {transport}\n  state dir: {}\n  jobs: {jobs}",
            self.ctx.paths.root().display()
        )
    }

    async fn jobs_report(&self) -> String {
        let jobs = self.ctx.scheduler.list().await;
        if jobs.is_empty() {
            return "No scheduled jobs.".into();
        }
        let mut out = format!("{} scheduled job(s):", jobs.len());
        for job in jobs {
            out.push_str(&format!(
                "\n  {}  {}  next {}  {}",
                job.short_id(),
                job.schedule.recurrence,
                format_run(job.next_run_at),
                job.action()
            ));
        }
        out
    }
}

fn lane_key(event: &Event) -> String {
    match event.reply_target() {
        Some(target) => target.session_key(),
        None => format!("{}:{}", event.kind, event.source),
    }
}

fn prompt_for(event: &Event, text: &str) -> String {
    match event.kind {
        EventKind::Timer => format!("A scheduled task is due: {text}"),
        EventKind::Sensor => format!("Observation from {}: {text}", event.source),
        _ => DEEP_PREFIX_RE.replace(text, "").trim().to_string(),
    }
}

/// Heuristic reply used when inference is unavailable. Always names why.
fn canned_reply(prompt: &str, reason: &str) -> String {
    if GREETING_RE.is_match(prompt) {
        format!("Hi! I'm here, but I can't think properly right now ({reason}).")
    } else if prompt.trim_end().ends_with('?') {
        format!("I can't answer that right now ({reason}). Ask me again in a bit.")
    } else {
        format!("Noted, but I can't think that through right now ({reason}).")
    }
}

fn format_run(at: Option<NaiveDateTime>) -> String {
    at.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".into())
}

fn format_uptime(elapsed: chrono::Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    let (days, hours, minutes) = (secs / 86_400, (secs % 86_400) / 3_600, (secs % 3_600) / 60);
    if days > 0 {
        format!("{days}d {hours}h {minutes:02}m")
    } else if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else {
        format!("{minutes}m {:02}s", secs % 60)
    }
}
