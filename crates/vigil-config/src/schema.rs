use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use vigil_core::{ReplyTarget, StatePaths};

/// Root configuration. Maps to `vigil.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    pub runtime: RuntimeConfig,
    pub cognition: CognitionConfig,
    pub session: SessionConfig,
    pub affect: AffectConfig,
    pub transport: TransportConfig,
    pub providers: Vec<ProviderConfig>,
    pub logging: LoggingConfig,
}

impl VigilConfig {
    /// State directory layout, honouring `runtime.state_dir`.
    pub fn state_paths(&self) -> StatePaths {
        match &self.runtime.state_dir {
            Some(dir) => StatePaths::with_root(dir.clone()),
            None => StatePaths::new(),
        }
    }
}

// ── Runtime ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Runtime state directory. Defaults to `~/.vigil/state`.
    pub state_dir: Option<PathBuf>,
    /// Seconds between heartbeat ticks (affect decay, scheduler, status snapshot).
    pub heartbeat_secs: u64,
    /// Developmental stage; scales the affect baseline and triage thresholds.
    pub life_stage: LifeStage,
    /// Where timer and sensor replies without their own target go,
    /// as `"channel:conversation-id"`.
    pub operator_conversation: Option<String>,
    /// Capacity of the local console input queue.
    pub local_queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            heartbeat_secs: 30,
            life_stage: LifeStage::Developing,
            operator_conversation: None,
            local_queue_capacity: 64,
        }
    }
}

impl RuntimeConfig {
    pub fn operator_target(&self) -> Option<ReplyTarget> {
        let raw = self.operator_conversation.as_deref()?;
        let (channel, conversation) = raw.split_once(':')?;
        if channel.is_empty() || conversation.is_empty() {
            return None;
        }
        Some(ReplyTarget::new(channel, conversation))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifeStage {
    Nascent,
    #[default]
    Developing,
    Mature,
}

impl LifeStage {
    /// Multipliers applied to the configured `[drive, novelty, stability, relief]` baseline.
    pub fn baseline_multipliers(self) -> [f64; 4] {
        match self {
            LifeStage::Nascent => [0.9, 1.25, 0.8, 1.0],
            LifeStage::Developing => [1.0, 1.0, 1.0, 1.0],
            LifeStage::Mature => [1.05, 0.85, 1.15, 1.0],
        }
    }

    /// Messages at least this many words long escalate to the deep path.
    pub fn deep_word_threshold(self) -> usize {
        match self {
            LifeStage::Nascent => 40,
            LifeStage::Developing => 80,
            LifeStage::Mature => 140,
        }
    }
}

impl std::fmt::Display for LifeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifeStage::Nascent => "nascent",
            LifeStage::Developing => "developing",
            LifeStage::Mature => "mature",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for LifeStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "nascent" => Ok(LifeStage::Nascent),
            "developing" => Ok(LifeStage::Developing),
            "mature" => Ok(LifeStage::Mature),
            other => Err(format!("unknown life stage '{other}'")),
        }
    }
}

// ── Cognition ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CognitionConfig {
    /// Latency budget for the fast path, in milliseconds.
    pub fast_timeout_ms: u64,
    /// Hard wall-clock budget for a deep-path inference call.
    pub deep_timeout_ms: u64,
    /// Budget for a single provider attempt before falling through to the next.
    pub provider_timeout_ms: u64,
    /// Retries per provider on transient failures.
    pub provider_retries: u32,
    /// Turns of history the fast path sees.
    pub fast_context_turns: usize,
    /// Capacity of the cognition work queue.
    pub queue_capacity: usize,
    /// System prompt prepended to every inference call.
    pub system_prompt: Option<String>,
}

impl Default for CognitionConfig {
    fn default() -> Self {
        Self {
            fast_timeout_ms: 8_000,
            deep_timeout_ms: 45_000,
            provider_timeout_ms: 30_000,
            provider_retries: 1,
            fast_context_turns: 4,
            queue_capacity: 256,
            system_prompt: None,
        }
    }
}

// ── Session ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// User turns (with their replies) replayed into a deep-path call.
    pub max_turns: usize,
    /// Character budget for replayed history.
    pub max_chars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_turns: 12,
            max_chars: 8_000,
        }
    }
}

// ── Affect ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffectConfig {
    pub baseline: AffectBaseline,
    /// Fraction of the distance to baseline recovered per heartbeat, in (0, 1].
    pub decay_rate: f64,
}

impl Default for AffectConfig {
    fn default() -> Self {
        Self {
            baseline: AffectBaseline::default(),
            decay_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffectBaseline {
    pub drive: f64,
    pub novelty: f64,
    pub stability: f64,
    pub relief: f64,
}

impl Default for AffectBaseline {
    fn default() -> Self {
        Self {
            drive: 0.5,
            novelty: 0.5,
            stability: 0.6,
            relief: 0.5,
        }
    }
}

impl AffectBaseline {
    pub fn as_array(&self) -> [f64; 4] {
        [self.drive, self.novelty, self.stability, self.relief]
    }
}

// ── Transport ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// "none" (console only) or "relay".
    pub kind: TransportKind,
    /// Base HTTP URL of the relay (send, typing, history).
    pub relay_url: Option<String>,
    /// WebSocket URL of the live stream. Derived from `relay_url` when unset.
    pub stream_url: Option<String>,
    /// Bearer token for the relay.
    pub token: Option<String>,
    /// Poll period while degraded.
    pub poll_interval_ms: u64,
    /// Attempts per outbound send before surfacing a failure.
    pub max_send_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound on a typing-indicator call; it never delays a reply longer.
    pub typing_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::None,
            relay_url: None,
            stream_url: None,
            token: None,
            poll_interval_ms: 5_000,
            max_send_attempts: 4,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            typing_timeout_ms: 1_500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    None,
    Relay,
}

// ── Providers ──────────────────────────────────────────────────

/// One entry of the ordered inference fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    /// OpenAI-compatible endpoint, e.g. "http://localhost:11434/v1".
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable to read the API key from when `api_key` is unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Executable for `kind = "command"`. Receives the prompt on stdin.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProviderConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    Command,
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let icon = match self.severity {
            WarningSeverity::Error => "❌",
            WarningSeverity::Warning => "⚠️ ",
            WarningSeverity::Info => "💡",
        };
        write!(f, "{} {}: {}", icon, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl VigilConfig {
    /// Validate the config and return a list of warnings.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Affect baseline ───
        let names = ["drive", "novelty", "stability", "relief"];
        for (name, value) in names.iter().zip(self.affect.baseline.as_array()) {
            if !(0.0..=1.0).contains(&value) {
                warnings.push(ConfigWarning {
                    field: format!("affect.baseline.{name}"),
                    message: format!("{value} is outside [0, 1]"),
                    severity: WarningSeverity::Error,
                    hint: Some("Affect channels are fractions between 0.0 and 1.0".into()),
                });
            }
        }
        if !(self.affect.decay_rate > 0.0 && self.affect.decay_rate <= 1.0) {
            warnings.push(ConfigWarning {
                field: "affect.decay_rate".into(),
                message: format!("decay rate {} must be in (0, 1]", self.affect.decay_rate),
                severity: WarningSeverity::Error,
                hint: Some("0.1 recovers a tenth of the distance to baseline per heartbeat".into()),
            });
        }

        // ── Timeouts ───
        let budgets = [
            ("cognition.fast_timeout_ms", self.cognition.fast_timeout_ms),
            ("cognition.deep_timeout_ms", self.cognition.deep_timeout_ms),
            ("cognition.provider_timeout_ms", self.cognition.provider_timeout_ms),
            ("runtime.heartbeat_secs", self.runtime.heartbeat_secs),
            ("transport.poll_interval_ms", self.transport.poll_interval_ms),
        ];
        for (field, value) in budgets {
            if value == 0 {
                warnings.push(ConfigWarning {
                    field: field.into(),
                    message: "must be greater than zero".into(),
                    severity: WarningSeverity::Error,
                    hint: None,
                });
            }
        }
        if self.cognition.fast_timeout_ms > self.cognition.deep_timeout_ms {
            warnings.push(ConfigWarning {
                field: "cognition.fast_timeout_ms".into(),
                message: "fast path budget exceeds the deep path budget".into(),
                severity: WarningSeverity::Warning,
                hint: Some("The fast path is meant to answer in low seconds".into()),
            });
        }

        // ── Session budget ───
        if self.session.max_turns == 0 || self.session.max_chars == 0 {
            warnings.push(ConfigWarning {
                field: "session".into(),
                message: "a zero history budget makes every conversation stateless".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Defaults are max_turns = 12, max_chars = 8000".into()),
            });
        }

        // ── Transport ───
        if self.transport.kind == TransportKind::Relay && self.transport.relay_url.is_none() {
            warnings.push(ConfigWarning {
                field: "transport.relay_url".into(),
                message: "relay transport selected but no relay_url set".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set e.g. relay_url = \"https://relay.example.net\"".into()),
            });
        }
        if self.transport.max_send_attempts == 0 {
            warnings.push(ConfigWarning {
                field: "transport.max_send_attempts".into(),
                message: "0 attempts means replies are never sent".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 4".into()),
            });
        }
        if self.runtime.operator_conversation.is_some() && self.runtime.operator_target().is_none() {
            warnings.push(ConfigWarning {
                field: "runtime.operator_conversation".into(),
                message: "expected \"channel:conversation-id\"".into(),
                severity: WarningSeverity::Warning,
                hint: None,
            });
        }

        // ── Providers ───
        if self.providers.is_empty() {
            warnings.push(ConfigWarning {
                field: "providers".into(),
                message: "no inference providers configured; replies will be canned".into(),
                severity: WarningSeverity::Info,
                hint: Some("Add a [[providers]] entry with kind = \"openai\" or \"command\"".into()),
            });
        }
        for (i, p) in self.providers.iter().enumerate() {
            match p.kind {
                ProviderKind::OpenAi if p.base_url.is_none() || p.model.is_none() => {
                    warnings.push(ConfigWarning {
                        field: format!("providers[{i}]"),
                        message: format!("provider '{}' needs base_url and model", p.name),
                        severity: WarningSeverity::Error,
                        hint: None,
                    });
                }
                ProviderKind::Command if p.command.is_none() => {
                    warnings.push(ConfigWarning {
                        field: format!("providers[{i}].command"),
                        message: format!("provider '{}' has no command", p.name),
                        severity: WarningSeverity::Error,
                        hint: None,
                    });
                }
                _ => {}
            }
        }

        // ── Logging ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
