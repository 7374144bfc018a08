use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::provider::*;

/// Runs an external program per call. The rendered prompt goes to stdin,
/// the reply is read from stdout, and `VIGIL_THINKING` carries the
/// requested thinking level.
pub struct CommandProvider {
    name: String,
    program: String,
    args: Vec<String>,
}

impl CommandProvider {
    pub fn new(name: &str, program: String, args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            program,
            args,
        }
    }

    fn command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out call drops the future; take the child down with it.
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl InferenceProvider for CommandProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, ctx: &PromptContext, thinking: ThinkingLevel) -> Result<String, InferenceError> {
        let mut cmd = self.command();
        cmd.env("VIGIL_THINKING", thinking.as_str());
        debug!(provider = %self.name, program = %self.program, "spawning inference command");

        let mut child = cmd
            .spawn()
            .map_err(|e| InferenceError::ProviderUnavailable(format!("failed to spawn {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = ctx.render_plain();
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|e| InferenceError::ProviderUnavailable(format!("failed to write prompt: {e}")))?;
            // Closing stdin signals end of prompt.
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| InferenceError::ProviderUnavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(InferenceError::ProviderUnavailable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status.code().unwrap_or(-1),
                stderr.chars().take(500).collect::<String>()
            )));
        }

        let reply = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if reply.is_empty() {
            return Err(InferenceError::InvalidResponse(format!("{} produced no output", self.program)));
        }
        Ok(reply)
    }

    async fn health_check(&self) -> Result<(), InferenceError> {
        let found = std::path::Path::new(&self.program).is_file()
            || std::env::var_os("PATH").is_some_and(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(&self.program).is_file())
            });
        if found {
            Ok(())
        } else {
            Err(InferenceError::ProviderUnavailable(format!("{} not found on PATH", self.program)))
        }
    }
}
