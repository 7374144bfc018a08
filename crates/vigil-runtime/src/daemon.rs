//! # Daemon
//!
//! Composes the runtime and keeps it alive:
//!
//! ```text
//!   ┌──────────────┐   inbound    ┌─────────┐   queue   ┌────────────┐
//!   │  transport   │────────────▶ │         │─────────▶ │ cognition  │
//!   │  supervisor  │◀──replies─── │   bus   │           │ dispatcher │
//!   └──────────────┘              │         │◀─timers── └────────────┘
//!   ┌──────────────┐   inbound    │         │           ┌────────────┐
//!   │ local input  │────────────▶ │         │◀───────── │ heartbeat  │
//!   └──────────────┘              └─────────┘           └────────────┘
//! ```
//!
//! One daemon per state directory. Everything except taking the lock is
//! recoverable; component errors are logged and the daemon keeps running.

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use vigil_channels::{ConnectionState, RelayTransport, ResilientTransport, Transport, TransportSettings};
use vigil_config::VigilConfig;
use vigil_config::schema::TransportKind;
use vigil_core::{
    Event, EventBus, EventKind, LOCAL_CHANNEL, LOCAL_CONVERSATION, ReplyTarget, Result, Severity, StatePaths,
    VigilError, jsonl,
};
use vigil_llm::ProviderChain;

use crate::affect::AffectSnapshot;
use crate::cognition::{CognitionScheduler, ReplySink};
use crate::context::RuntimeContext;
use crate::lock::StateLock;

/// Sender id attached to console input.
pub const CONSOLE_SENDER: &str = "operator";

/// `status.json`, rewritten every heartbeat for `vigil status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub pid: u32,
    pub running: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub life_stage: String,
    pub transport: Option<ConnectionState>,
    pub affect: AffectSnapshot,
    pub operator: Option<String>,
    pub providers: Vec<String>,
    pub jobs: usize,
    pub sessions: usize,
}

/// Last status snapshot written by a daemon using `paths`.
pub fn read_status(paths: &StatePaths) -> Result<Option<DaemonStatus>> {
    jsonl::read_json(&paths.status_file())
}

/// The transport `[transport]` asks for, if any.
pub fn transport_from_config(config: &VigilConfig) -> Result<Option<Arc<dyn Transport>>> {
    match config.transport.kind {
        TransportKind::None => Ok(None),
        TransportKind::Relay => Ok(Some(Arc::new(RelayTransport::from_config(&config.transport)?))),
    }
}

// ── Local input ────────────────────────────────────────────────

/// Handle for feeding console lines into the daemon.
#[derive(Clone)]
pub struct LocalInput {
    tx: mpsc::Sender<String>,
}

impl LocalInput {
    /// Queue a line without waiting. Fails if the queue is full or the
    /// daemon has stopped.
    pub fn submit(&self, text: &str) -> Result<()> {
        self.tx.try_send(text.to_string()).map_err(|e| match e {
            TrySendError::Full(_) => VigilError::Other(anyhow::anyhow!("local input queue is full")),
            TrySendError::Closed(_) => VigilError::Other(anyhow::anyhow!("daemon is not running")),
        })
    }
}

async fn local_input_worker(bus: EventBus, mut rx: mpsc::Receiver<String>, cancel: CancellationToken) {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(line) => line,
                None => break,
            },
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let message_id = Uuid::new_v4().to_string();
        bus.publish(Event::inbound_message(
            LOCAL_CHANNEL,
            LOCAL_CONVERSATION,
            &message_id,
            CONSOLE_SENDER,
            text,
        ));
    }
    debug!("local input worker stopped");
}

// ── Reply routing ──────────────────────────────────────────────

struct DaemonSink {
    console: mpsc::Sender<String>,
    transport: Option<Arc<ResilientTransport>>,
}

#[async_trait]
impl ReplySink for DaemonSink {
    async fn deliver(&self, target: &ReplyTarget, text: &str) -> Result<()> {
        if target.is_local() {
            return self
                .console
                .try_send(text.to_string())
                .map_err(|e| VigilError::Other(anyhow::anyhow!("console reply dropped: {e}")));
        }
        match &self.transport {
            Some(transport) if transport.channel_name() == target.channel => {
                transport.send_reply(&target.conversation_id, text).await?;
                Ok(())
            }
            _ => Err(VigilError::ConfigurationMissing {
                what: format!("transport for channel '{}'", target.channel),
                hint: "configure [transport] or route replies to the console".into(),
            }),
        }
    }
}

// ── Status ─────────────────────────────────────────────────────

#[derive(Clone)]
struct StatusWriter {
    ctx: Arc<RuntimeContext>,
    transport: Option<Arc<ResilientTransport>>,
    providers: Vec<String>,
}

impl StatusWriter {
    async fn write(&self, running: bool) {
        let jobs = self.ctx.scheduler.len().await;
        let affect = self.ctx.affect.lock().snapshot();
        let status = DaemonStatus {
            pid: std::process::id(),
            running,
            started_at: self.ctx.started_at,
            updated_at: Utc::now(),
            life_stage: self.ctx.config.runtime.life_stage.to_string(),
            transport: self.transport.as_ref().map(|t| t.state()),
            affect,
            operator: self.ctx.identity.as_ref().map(|i| i.operator_id.clone()),
            providers: self.providers.clone(),
            jobs,
            sessions: self.ctx.sessions.keys().map(|k| k.len()).unwrap_or(0),
        };
        if let Err(e) = jsonl::write_json(&self.ctx.paths.status_file(), &status) {
            warn!(error = %e, "failed to write status snapshot");
        }
    }
}

// ── Heartbeat ──────────────────────────────────────────────────

async fn heartbeat(
    ctx: Arc<RuntimeContext>,
    status: StatusWriter,
    last_activity: Arc<Mutex<Instant>>,
    live_config: Option<Arc<RwLock<VigilConfig>>>,
    cancel: CancellationToken,
) {
    let period = Duration::from_secs(ctx.config.runtime.heartbeat_secs.max(1));
    let mut affect_config = ctx.config.affect.clone();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        if let Some(live) = &live_config {
            let latest = live.read().affect.clone();
            if latest != affect_config {
                ctx.affect.lock().rebase(&latest, ctx.config.runtime.life_stage);
                info!(decay_rate = latest.decay_rate, "affect settings reloaded");
                affect_config = latest;
            }
        }

        {
            let idle = last_activity.lock().elapsed() >= period;
            let mut affect = ctx.affect.lock();
            affect.decay(affect_config.decay_rate);
            if idle {
                affect.idle(period);
            }
        }

        let fired = ctx.scheduler.tick(Local::now().naive_local()).await;
        if !fired.is_empty() {
            debug!(jobs = fired.len(), "heartbeat fired jobs");
        }

        status.write(true).await;

        if let Err(e) = ctx.affect.lock().persist(&ctx.paths.affect_file()) {
            warn!(error = %e, "failed to persist affect snapshot");
        }
    }
    debug!("heartbeat stopped");
}

fn log_system_event(event: &Event) {
    let code = event.code().unwrap_or("system");
    let detail = event.text().unwrap_or_default();
    match event.severity {
        Severity::High => warn!(code, source = %event.source, detail, "system event"),
        Severity::Normal => info!(code, source = %event.source, detail, "system event"),
        Severity::Low => debug!(code, source = %event.source, detail, "system event"),
    }
}

// ── Daemon ─────────────────────────────────────────────────────

pub struct Daemon {
    ctx: Arc<RuntimeContext>,
    cognition: Arc<CognitionScheduler>,
    transport: Option<Arc<ResilientTransport>>,
    local_tx: mpsc::Sender<String>,
    local_rx: mpsc::Receiver<String>,
    console_rx: Option<mpsc::Receiver<String>>,
    providers: Vec<String>,
    live_config: Option<Arc<RwLock<VigilConfig>>>,
    _lock: StateLock,
}

impl Daemon {
    /// Take the state lock, load the runtime context, and wire components.
    /// Nothing runs until [`Daemon::run`].
    pub fn start(config: VigilConfig, transport: Option<Arc<dyn Transport>>, chain: ProviderChain) -> Result<Self> {
        let paths = config.state_paths();
        let lock = StateLock::acquire(&paths)?;
        let ctx = Arc::new(RuntimeContext::init(config)?);

        let transport = transport.map(|inner| {
            Arc::new(ResilientTransport::new(
                inner,
                ctx.bus.clone(),
                TransportSettings::from(&ctx.config.transport),
                paths.transport_cursor_file(),
            ))
        });

        let capacity = ctx.config.runtime.local_queue_capacity.max(1);
        let (console_tx, console_rx) = mpsc::channel(capacity);
        let (local_tx, local_rx) = mpsc::channel(capacity);

        let providers: Vec<String> = chain.providers().iter().map(|p| p.name().to_string()).collect();
        let sink = Arc::new(DaemonSink {
            console: console_tx,
            transport: transport.clone(),
        });
        let mut cognition = CognitionScheduler::new(Arc::clone(&ctx), chain, sink);
        if let Some(transport) = &transport {
            cognition = cognition.with_transport_state(transport.subscribe_state());
        }

        info!(
            pid = std::process::id(),
            state_dir = %paths.root().display(),
            transport = transport.as_ref().map(|t| t.channel_name()).unwrap_or("none"),
            providers = providers.len(),
            "daemon started"
        );

        Ok(Self {
            ctx,
            cognition: Arc::new(cognition),
            transport,
            local_tx,
            local_rx,
            console_rx: Some(console_rx),
            providers,
            live_config: None,
            _lock: lock,
        })
    }

    /// Follow a reloadable config. The heartbeat picks up `[affect]` changes;
    /// everything else is read once at start.
    pub fn with_live_config(mut self, live: Arc<RwLock<VigilConfig>>) -> Self {
        self.live_config = Some(live);
        self
    }

    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }

    pub fn cognition(&self) -> &Arc<CognitionScheduler> {
        &self.cognition
    }

    pub fn transport(&self) -> Option<&Arc<ResilientTransport>> {
        self.transport.as_ref()
    }

    pub fn local_input(&self) -> LocalInput {
        LocalInput {
            tx: self.local_tx.clone(),
        }
    }

    /// Replies addressed to the console. Can be taken once.
    pub fn take_console(&mut self) -> Option<mpsc::Receiver<String>> {
        self.console_rx.take()
    }

    /// Run every task until `cancel` fires, then shut down in order.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Daemon {
            ctx,
            cognition,
            transport,
            local_tx,
            local_rx,
            console_rx,
            providers,
            live_config,
            _lock,
        } = self;
        drop(console_rx);
        drop(local_tx);

        let logger = ctx.bus.subscribe(
            |e| e.kind == EventKind::System,
            |e| {
                log_system_event(e);
                Ok(())
            },
        );
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let activity = {
            let last_activity = Arc::clone(&last_activity);
            ctx.bus.subscribe(
                |e| e.kind == EventKind::InboundMessage,
                move |_| {
                    *last_activity.lock() = Instant::now();
                    Ok(())
                },
            )
        };
        let (intake, queue) = cognition.attach();

        let status = StatusWriter {
            ctx: Arc::clone(&ctx),
            transport: transport.clone(),
            providers,
        };

        let mut tasks = JoinSet::new();
        if let Some(transport) = &transport {
            tasks.spawn(Arc::clone(transport).run(cancel.child_token()));
        }
        tasks.spawn(Arc::clone(&cognition).run(queue, cancel.child_token()));
        tasks.spawn(local_input_worker(ctx.bus.clone(), local_rx, cancel.child_token()));
        tasks.spawn(heartbeat(
            Arc::clone(&ctx),
            status.clone(),
            last_activity,
            live_config,
            cancel.child_token(),
        ));
        info!(tasks = tasks.len(), "daemon running");

        cancel.cancelled().await;
        info!("daemon shutting down");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "daemon task failed");
            }
        }
        for id in [intake, activity, logger] {
            ctx.bus.unsubscribe(id);
        }

        if let Err(e) = ctx.shutdown() {
            error!(error = %e, "failed to persist runtime state");
        }
        status.write(false).await;
        info!("daemon stopped");
        Ok(())
    }
}
