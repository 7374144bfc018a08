use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use vigil_core::{Result, VigilError};

use crate::schema::VigilConfig;

/// Loads and optionally hot-reloads the Vigil configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<VigilConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > VIGIL_CONFIG env > ~/.vigil/vigil.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("VIGIL_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".vigil")
            .join("vigil.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::parse_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            VigilConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
            }
            Err(e) => return Err(VigilError::Config(e)),
        }

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Build a loader around an in-memory config (tests, embedding).
    pub fn from_config(config: VigilConfig, config_path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        }
    }

    fn parse_file(path: &Path) -> Result<VigilConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<VigilConfig>(&raw)
            .map_err(|e| VigilError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> VigilConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<VigilConfig>> {
        Arc::clone(&self.config)
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Apply env var overrides (VIGIL_STATE_DIR, VIGIL_LIFE_STAGE, etc.)
    fn apply_env_overrides(mut config: VigilConfig) -> VigilConfig {
        if let Ok(v) = std::env::var("VIGIL_STATE_DIR") {
            config.runtime.state_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("VIGIL_LIFE_STAGE") {
            match v.parse() {
                Ok(stage) => config.runtime.life_stage = stage,
                Err(e) => warn!(error = %e, "ignoring VIGIL_LIFE_STAGE"),
            }
        }
        if let Ok(v) = std::env::var("VIGIL_LOG_LEVEL") {
            config.logging.level = v;
        }
        // Token: config file takes priority, env is the fallback.
        if config.transport.token.is_none()
            && let Ok(v) = std::env::var("VIGIL_RELAY_TOKEN")
        {
            config.transport.token = Some(v);
        }
        config
    }

    /// Reload the config from disk. Invalid files leave the current config in place.
    pub fn reload(&self) -> Result<()> {
        if !self.config_path.exists() {
            return Err(VigilError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::apply_env_overrides(Self::parse_file(&self.config_path)?);
        new_config.validate().map_err(VigilError::Config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    /// Start a background file watcher that reloads when the config file changes.
    /// Returns a handle to the watcher (must be kept alive for watching to continue).
    pub fn watch(&self) -> Result<notify::RecommendedWatcher> {
        let config = Arc::clone(&self.config);
        let config_path = self.config_path.clone();

        info!(?config_path, "starting config file watcher");

        let path_for_event = config_path.clone();
        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<NotifyEvent, notify::Error>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "file watcher error");
                        return;
                    }
                };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                let is_our_file = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == path_for_event.file_name());
                if !is_our_file {
                    return;
                }

                info!("config file changed, reloading");
                match ConfigLoader::parse_file(&path_for_event) {
                    Ok(new_config) => {
                        let new_config = ConfigLoader::apply_env_overrides(new_config);
                        match new_config.validate() {
                            Ok(_) => {
                                *config.write() = new_config;
                                info!("configuration hot-reloaded successfully");
                            }
                            Err(e) => warn!(error = %e, "config file has errors, keeping current config"),
                        }
                    }
                    Err(e) => warn!(error = %e, "config file has errors, keeping current config"),
                }
            })
            .map_err(|e| VigilError::Config(format!("failed to create file watcher: {}", e)))?;

        // Watch the parent directory (some editors create temp files + rename)
        let watch_path = self.config_path.parent().unwrap_or(Path::new("."));
        watcher
            .watch(watch_path, RecursiveMode::NonRecursive)
            .map_err(|e| VigilError::Config(format!("failed to watch config directory: {}", e)))?;

        Ok(watcher)
    }
}
