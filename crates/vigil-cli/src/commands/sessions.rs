use chrono::Local;

use vigil_config::VigilConfig;
use vigil_core::{Result, Role};
use vigil_runtime::SessionStore;

use super::{SessionsAction, truncate_output};

pub(super) fn cmd_sessions(config: &VigilConfig, action: SessionsAction) -> Result<()> {
    let store = SessionStore::new(config.state_paths());
    match action {
        SessionsAction::List => {
            let keys = store.keys()?;
            if keys.is_empty() {
                println!("No sessions yet.");
                return Ok(());
            }
            println!("\x1b[1mSessions\x1b[0m ({})", keys.len());
            println!("{}", "-".repeat(80));
            for key in &keys {
                let transcript = store.transcript(key)?;
                let last = transcript
                    .last()
                    .map(|m| m.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".into());
                println!("{key:<32} {:>5} messages  last {last}", transcript.len());
            }
            Ok(())
        }
        SessionsAction::Show { key, limit } => {
            let transcript = store.transcript(&key)?;
            if transcript.is_empty() {
                println!("No messages in session '{key}'.");
                return Ok(());
            }
            let skip = transcript.len().saturating_sub(limit);
            for message in &transcript[skip..] {
                let ts = message.created_at.with_timezone(&Local).format("%H:%M:%S");
                let who = match message.role {
                    Role::User => "\x1b[36myou\x1b[0m",
                    Role::Assistant => "\x1b[32mvigil\x1b[0m",
                };
                println!("\x1b[90m{ts}\x1b[0m {who}> {}", truncate_output(&message.text, 400));
            }
            Ok(())
        }
    }
}
