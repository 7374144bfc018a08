use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for the entire Vigil runtime.
#[derive(Error, Debug)]
pub enum VigilError {
    // ── Transport errors ───────────────────────────────────────
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    #[error("unrecoverable transport auth error: {0}")]
    UnrecoverableAuth(String),

    // ── Inference errors ───────────────────────────────────────
    #[error("inference failure: {0}")]
    Inference(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("configuration missing: {what} ({hint})")]
    ConfigurationMissing { what: String, hint: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Runtime component errors ───────────────────────────────
    #[error("schedule error: {0}")]
    Schedule(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("state directory {} is locked by another daemon{}", path.display(), pid.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    LockHeld { path: PathBuf, pid: Option<u32> },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VigilError>;
