use std::path::{Path, PathBuf};

use chrono::NaiveDate;

/// Layout of the runtime state directory. Everything the daemon persists
/// lives under one root so the single-instance lock can protect it.
#[derive(Debug, Clone)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl Default for StatePaths {
    fn default() -> Self {
        Self::new()
    }
}

impl StatePaths {
    /// `~/.vigil/state`, or `./.vigil/state` without a home directory.
    pub fn new() -> Self {
        let root = dirs::home_dir()
            .map(|h| h.join(".vigil").join("state"))
            .unwrap_or_else(|| PathBuf::from(".vigil").join("state"));
        Self { root }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("vigil.lock")
    }

    pub fn status_file(&self) -> PathBuf {
        self.root.join("status.json")
    }

    pub fn identity_file(&self) -> PathBuf {
        self.root.join("identity.json")
    }

    pub fn affect_file(&self) -> PathBuf {
        self.root.join("affect.jsonl")
    }

    pub fn jobs_file(&self) -> PathBuf {
        self.root.join("jobs.jsonl")
    }

    // Sessions

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn session_archive_dir(&self) -> PathBuf {
        self.sessions_dir().join("archive")
    }

    /// Transcript file for a session key. The escaping is reversible so two
    /// distinct keys can never map to the same file.
    pub fn session_file(&self, session_key: &str) -> PathBuf {
        self.sessions_dir()
            .join(format!("{}.jsonl", escape_key(session_key)))
    }

    // Audit

    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    pub fn audit_file(&self, date: NaiveDate) -> PathBuf {
        self.audit_dir().join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    // Transport

    pub fn transport_dir(&self) -> PathBuf {
        self.root.join("transport")
    }

    pub fn transport_cursor_file(&self) -> PathBuf {
        self.transport_dir().join("cursor.json")
    }

    /// Create every directory the runtime writes into.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.sessions_dir())?;
        std::fs::create_dir_all(self.session_archive_dir())?;
        std::fs::create_dir_all(self.audit_dir())?;
        std::fs::create_dir_all(self.transport_dir())?;
        Ok(())
    }
}

/// Escape a session key into a file stem.
pub fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            _ => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape_key`].
pub fn unescape_key(stem: &str) -> String {
    stem.replace("%3A", ":")
        .replace("%2F", "/")
        .replace("%5C", "\\")
        .replace("%25", "%")
}
