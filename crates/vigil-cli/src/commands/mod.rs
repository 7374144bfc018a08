use chrono::Local;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use vigil_config::{ConfigLoader, TransportKind, VigilConfig, WarningSeverity};
use vigil_core::{AuditLog, Event, Result, Severity, StatePaths, VigilError};
use vigil_llm::InferenceProvider;
use vigil_runtime::{StateLock, chain_from_config, identity, read_status, transport_from_config};

mod jobs;
mod sessions;
mod start;

/// Vigil: an always-on personal agent runtime
#[derive(Parser)]
#[command(name = "vigil", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to vigil.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon until interrupted
    Start {
        /// Read operator messages from stdin and print replies
        #[arg(short, long)]
        interactive: bool,
    },
    /// Show the last status snapshot written by the daemon
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check configuration, identity, providers, and the state directory
    Doctor,
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set a config value in vigil.toml (dot-notation key)
    Set {
        /// Config key in dot notation (e.g. runtime.life_stage, session.max_turns)
        key: String,
        /// Value to set
        value: String,
    },
    /// Manage scheduled jobs
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },
    /// Inspect conversation transcripts
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Show recent audit log events
    Audit {
        /// Number of events to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,

        /// Filter by event kind or system code prefix (e.g. timer, transport.)
        #[arg(short, long)]
        kind: Option<String>,

        /// Output as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Record who the operator is (only while the daemon is stopped)
    Imprint {
        /// Sender id the operator uses on the transport
        operator_id: String,
        /// Replace an existing identity
        #[arg(long)]
        force: bool,
    },
    /// Show version and build info
    Version,
    /// Generate shell completions for bash, zsh, or fish
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum JobsAction {
    /// List scheduled jobs
    List,
    /// Schedule a job from a phrase, e.g. "every weekday at 9am check the build"
    Add {
        #[arg(required = true, trailing_var_arg = true)]
        phrase: Vec<String>,
    },
    /// Remove a job by id or unique id prefix
    Remove { id: String },
}

#[derive(Subcommand)]
enum SessionsAction {
    /// List sessions with message counts
    List,
    /// Print the tail of one transcript
    Show {
        /// Session key, e.g. local:console
        key: String,
        /// Number of messages to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        init_tracing(&config, self.verbose, self.quiet, self.log_level.as_deref());

        match self.command {
            Commands::Start { interactive } => start::cmd_start(config, config_loader, interactive).await,
            Commands::Status { json } => Self::cmd_status(&config, json),
            Commands::Doctor => Self::cmd_doctor(&config).await,
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Set { key, value } => Self::cmd_config_set(config_loader.path(), &key, &value),
            Commands::Jobs { action } => jobs::cmd_jobs(&config, action).await,
            Commands::Sessions { action } => sessions::cmd_sessions(&config, action),
            Commands::Audit { limit, kind, json } => Self::cmd_audit(&config, limit, kind, json),
            Commands::Imprint { operator_id, force } => Self::cmd_imprint(&config, &operator_id, force),
            Commands::Version => Self::cmd_version(),
            Commands::Completions { shell } => Self::cmd_completions(shell),
        }
    }

    fn cmd_status(config: &VigilConfig, json: bool) -> Result<()> {
        let paths = config.state_paths();
        let Some(status) = read_status(&paths)? else {
            println!("❌ Vigil has not run with state dir {}", paths.root().display());
            return Ok(());
        };

        if json {
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }

        let running = StateLock::is_held(&paths);
        if running {
            println!("✅ Vigil is running (pid {})", status.pid);
        } else {
            println!("⏹  Vigil is stopped (last pid {})", status.pid);
        }
        println!("   State dir:  {}", paths.root().display());
        println!(
            "   Started:    {}",
            status.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        );
        println!(
            "   Updated:    {}",
            status.updated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        );
        println!("   Life stage: {}", status.life_stage);
        println!(
            "   Transport:  {}",
            status
                .transport
                .map(|s| s.to_string())
                .unwrap_or_else(|| "console only".into())
        );
        println!("   Affect:     {}", status.affect);
        println!(
            "   Operator:   {}",
            status.operator.as_deref().unwrap_or("not imprinted")
        );
        if status.providers.is_empty() {
            println!("   Providers:  none (canned replies only)");
        } else {
            println!("   Providers:  {}", status.providers.join(", "));
        }
        println!("   Jobs:       {}", status.jobs);
        println!("   Sessions:   {}", status.sessions);

        if !running && status.running {
            println!();
            println!("⚠️  The last snapshot says running but no daemon holds the lock; it may have crashed.");
        }
        Ok(())
    }

    fn cmd_config(config: &VigilConfig, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(config).map_err(|e| VigilError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    fn cmd_config_set(path: &Path, key: &str, value: &str) -> Result<()> {
        let content = if path.exists() {
            std::fs::read_to_string(path)
                .map_err(|e| VigilError::Config(format!("Cannot read {}: {}", path.display(), e)))?
        } else {
            String::new()
        };

        let mut doc = content
            .parse::<toml_edit::DocumentMut>()
            .map_err(|e| VigilError::Config(format!("Invalid TOML in {}: {}", path.display(), e)))?;

        let old_value = apply_setting(&mut doc, key, value)?;

        // Refuse edits that would stop the daemon from starting.
        let updated = doc.to_string();
        let parsed: VigilConfig = toml::from_str(&updated)
            .map_err(|e| VigilError::Config(format!("{key} = {value} does not fit the schema: {e}")))?;
        parsed.validate().map_err(VigilError::Config)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, updated)
            .map_err(|e| VigilError::Config(format!("Cannot write {}: {}", path.display(), e)))?;

        match old_value {
            Some(old) => println!("✅ {} = {} (was {})", key, value, old.trim()),
            None => println!("✅ {key} = {value} (new)"),
        }
        Ok(())
    }

    async fn cmd_doctor(config: &VigilConfig) -> Result<()> {
        println!("🩺 Vigil Doctor");
        println!();

        let mut passed = 0;
        let mut warn_count = 0;
        let mut info_count = 0;

        // Hard errors already failed the config load.
        let warnings = config.validate().unwrap_or_default();
        for w in &warnings {
            println!("  {w}");
            match w.severity {
                WarningSeverity::Info => info_count += 1,
                _ => warn_count += 1,
            }
        }
        if warnings.is_empty() {
            println!("  ✅ config: valid");
            passed += 1;
        }

        let paths = config.state_paths();
        match paths.ensure_dirs() {
            Ok(()) => {
                println!("  ✅ state dir: {}", paths.root().display());
                passed += 1;
            }
            Err(e) => {
                println!("  ❌ state dir: {}: {e}", paths.root().display());
                warn_count += 1;
            }
        }

        match identity::load(&paths) {
            Ok(Some(operator)) => {
                println!(
                    "  ✅ operator: {} (imprinted {})",
                    operator.operator_id,
                    operator.imprinted_at.format("%Y-%m-%d")
                );
                passed += 1;
            }
            Ok(None) => {
                println!("  ⚠️  operator: {}", identity::missing_identity());
                warn_count += 1;
            }
            Err(e) => {
                println!("  ❌ operator: unreadable identity file: {e}");
                warn_count += 1;
            }
        }

        if StateLock::is_held(&paths) {
            let pid = StateLock::holder_pid(&paths)
                .map(|p| format!(" (pid {p})"))
                .unwrap_or_default();
            println!("  ✅ daemon: running{pid}");
            passed += 1;
        } else {
            println!("  💡 daemon: not running (start it with `vigil start`)");
            info_count += 1;
        }

        match chain_from_config(config) {
            Ok(chain) if chain.is_empty() => {
                println!("  💡 providers: none configured; replies will be canned");
                info_count += 1;
            }
            Ok(chain) => {
                for provider in chain.providers() {
                    match tokio::time::timeout(Duration::from_secs(5), provider.health_check()).await {
                        Ok(Ok(())) => {
                            println!("  ✅ provider {}: reachable", provider.name());
                            passed += 1;
                        }
                        Ok(Err(e)) => {
                            println!("  ⚠️  provider {}: {e}", provider.name());
                            warn_count += 1;
                        }
                        Err(_) => {
                            println!("  ⚠️  provider {}: health check timed out", provider.name());
                            warn_count += 1;
                        }
                    }
                }
            }
            Err(e) => {
                println!("  ❌ providers: {e}");
                warn_count += 1;
            }
        }

        match (config.transport.kind, transport_from_config(config)) {
            (TransportKind::None, _) => {
                println!("  💡 transport: none (console only)");
                info_count += 1;
            }
            (_, Ok(_)) => {
                println!(
                    "  ✅ transport: relay at {}",
                    config.transport.relay_url.as_deref().unwrap_or("?")
                );
                passed += 1;
            }
            (_, Err(e)) => {
                println!("  ❌ transport: {e}");
                warn_count += 1;
            }
        }

        println!();
        println!("  ✅ {passed} checks passed, ⚠️  {warn_count} warnings, 💡 {info_count} suggestions");
        Ok(())
    }

    fn cmd_audit(config: &VigilConfig, limit: usize, kind: Option<String>, json: bool) -> Result<()> {
        let log = AuditLog::new(config.state_paths().audit_dir());
        let events = match &kind {
            Some(filter) => {
                let mut matching: Vec<Event> = log
                    .tail(usize::MAX)?
                    .into_iter()
                    .filter(|e| matches_kind(e, filter))
                    .collect();
                let skip = matching.len().saturating_sub(limit);
                matching.split_off(skip)
            }
            None => log.tail(limit)?,
        };

        if json {
            for event in &events {
                println!("{}", serde_json::to_string(event)?);
            }
            return Ok(());
        }

        if events.is_empty() {
            println!(
                "No audit log entries{}",
                kind.as_ref().map(|k| format!(" matching '{k}'")).unwrap_or_default()
            );
            return Ok(());
        }

        println!("\x1b[1mAudit Log\x1b[0m ({} entries)", events.len());
        println!("{}", "-".repeat(80));
        for event in &events {
            let ts = event.occurred_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S");
            let color = match event.severity {
                Severity::High => "\x1b[31m",
                Severity::Normal => "\x1b[36m",
                Severity::Low => "\x1b[90m",
            };
            let label = event.code().map(str::to_string).unwrap_or_else(|| event.kind.to_string());
            println!("\x1b[90m{ts}\x1b[0m  {color}{label}\x1b[0m  {}", event.source);
            if let Some(text) = event.text()
                && !text.is_empty()
            {
                println!("   \x1b[90m{}\x1b[0m", truncate_output(text, 120));
            }
        }
        Ok(())
    }

    fn cmd_imprint(config: &VigilConfig, operator_id: &str, force: bool) -> Result<()> {
        let paths = config.state_paths();
        ensure_stopped(&paths)?;
        paths.ensure_dirs()?;
        let operator = identity::imprint(&paths, operator_id, force)?;
        println!("✅ Imprinted operator '{}'", operator.operator_id);
        println!("   Sensitive requests from other senders will be refused.");
        Ok(())
    }

    fn cmd_version() -> Result<()> {
        println!("🔭 Vigil v{}", env!("CARGO_PKG_VERSION"));
        println!("   Rust edition: 2024");
        println!("   Target: {}", std::env::consts::ARCH);
        println!("   OS: {}", std::env::consts::OS);
        #[cfg(debug_assertions)]
        println!("   Profile: debug");
        #[cfg(not(debug_assertions))]
        println!("   Profile: release");
        Ok(())
    }

    fn cmd_completions(shell: Shell) -> Result<()> {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "vigil", &mut std::io::stdout());
        Ok(())
    }
}

/// Install the global subscriber. `RUST_LOG` wins, then the flags, then
/// `[logging]`. Logs go to stderr so command output stays pipeable.
fn init_tracing(config: &VigilConfig, verbose: bool, quiet: bool, log_level: Option<&str>) {
    let level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        log_level.unwrap_or(&config.logging.level)
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format.as_str() {
        "json" => builder.json().with_target(true).init(),
        "compact" => builder.compact().with_target(false).init(),
        _ => builder.with_target(false).init(),
    }
}

/// Offline edits to the state directory must not race a running daemon.
fn ensure_stopped(paths: &StatePaths) -> Result<()> {
    if StateLock::is_held(paths) {
        return Err(VigilError::LockHeld {
            path: paths.root().to_path_buf(),
            pid: StateLock::holder_pid(paths),
        });
    }
    Ok(())
}

/// Write `value` at dot-notation `key`, creating tables along the way.
/// Returns the previous value, if any.
fn apply_setting(doc: &mut toml_edit::DocumentMut, key: &str, value: &str) -> Result<Option<String>> {
    let parts: Vec<&str> = key.split('.').collect();
    if parts.iter().any(|p| p.trim().is_empty()) {
        return Err(VigilError::Config(format!("Invalid key '{key}'")));
    }

    let table_parts = &parts[..parts.len() - 1];
    let leaf_key = parts[parts.len() - 1];

    let mut table: &mut toml_edit::Item = doc.as_item_mut();
    for part in table_parts {
        if table.get(part).is_none() {
            table[part] = toml_edit::Item::Table(toml_edit::Table::new());
        }
        table = &mut table[part];
        if !table.is_table_like() {
            return Err(VigilError::Config(format!("'{part}' in '{key}' is not a table")));
        }
    }

    let old_value = table.get(leaf_key).map(|v| v.to_string());
    table[leaf_key] = infer_value(value);
    Ok(old_value)
}

/// Infer the value type: bool, integer, float, or string.
fn infer_value(value: &str) -> toml_edit::Item {
    if value == "true" {
        toml_edit::value(true)
    } else if value == "false" {
        toml_edit::value(false)
    } else if let Ok(i) = value.parse::<i64>() {
        toml_edit::value(i)
    } else if let Ok(f) = value.parse::<f64>() {
        toml_edit::value(f)
    } else {
        toml_edit::value(value)
    }
}

fn matches_kind(event: &Event, filter: &str) -> bool {
    event.kind.to_string() == filter || event.code().is_some_and(|code| code.starts_with(filter))
}

/// Truncate a string to `max` characters, appending "..." if truncated.
fn truncate_output(s: &str, max: usize) -> String {
    let flat = s.replace('\n', " ");
    if flat.chars().count() <= max {
        flat
    } else {
        format!("{}...", flat.chars().take(max).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_jobs_add_joins_trailing_words() {
        let cli = Cli::try_parse_from(["vigil", "jobs", "add", "every", "day", "at", "9am", "stretch"]).unwrap();
        match cli.command {
            Commands::Jobs {
                action: JobsAction::Add { phrase },
            } => assert_eq!(phrase.join(" "), "every day at 9am stretch"),
            _ => panic!("expected jobs add"),
        }
    }

    #[test]
    fn test_apply_setting_creates_tables_and_infers_types() {
        let mut doc = "[runtime]\nheartbeat_secs = 30\n".parse::<toml_edit::DocumentMut>().unwrap();

        let old = apply_setting(&mut doc, "runtime.heartbeat_secs", "10").unwrap();
        assert_eq!(old.as_deref().map(str::trim), Some("30"));
        apply_setting(&mut doc, "affect.decay_rate", "0.25").unwrap();
        apply_setting(&mut doc, "runtime.life_stage", "mature").unwrap();

        let parsed: VigilConfig = toml::from_str(&doc.to_string()).unwrap();
        assert_eq!(parsed.runtime.heartbeat_secs, 10);
        assert_eq!(parsed.affect.decay_rate, 0.25);
        assert_eq!(parsed.runtime.life_stage.to_string(), "mature");
    }

    #[test]
    fn test_apply_setting_rejects_bad_keys() {
        let mut doc = "[runtime]\nheartbeat_secs = 30\n".parse::<toml_edit::DocumentMut>().unwrap();
        assert!(apply_setting(&mut doc, "", "1").is_err());
        assert!(apply_setting(&mut doc, "runtime..x", "1").is_err());
        assert!(apply_setting(&mut doc, "runtime.heartbeat_secs.inner", "1").is_err());
    }

    #[test]
    fn test_ensure_stopped_refuses_while_locked() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = StatePaths::with_root(dir.path());
        assert!(ensure_stopped(&paths).is_ok());

        let _lock = StateLock::acquire(&paths).unwrap();
        assert!(matches!(ensure_stopped(&paths), Err(VigilError::LockHeld { .. })));
    }

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("short", 10), "short");
        assert_eq!(truncate_output("a\nb", 10), "a b");
        assert_eq!(truncate_output("abcdef", 3), "abc...");
    }
}
