use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use vigil_core::{Message, Role, VigilError};

/// How much reasoning effort to request from a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Off,
    #[default]
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ThinkingLevel::Off => "off",
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
        }
    }
}

/// Everything a provider sees for one call.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub system: Option<String>,
    /// Prior turns, oldest first.
    pub history: Vec<Message>,
    /// The text to answer.
    pub prompt: String,
}

impl PromptContext {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system = system;
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    /// Flatten the context into a single plain-text transcript, for
    /// providers that take one blob of input.
    pub fn render_plain(&self) -> String {
        let mut out = String::new();
        if let Some(system) = &self.system {
            out.push_str(system);
            out.push_str("\n\n");
        }
        for msg in &self.history {
            let who = match msg.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            out.push_str(&format!("{who}: {}\n", msg.text));
        }
        out.push_str(&format!("User: {}\nAssistant:", self.prompt));
        out
    }
}

#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("inference timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl InferenceError {
    /// Worth retrying against the same provider.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::Timeout(_) => true,
            InferenceError::ProviderUnavailable(msg) => {
                msg.starts_with("HTTP 429")
                    || msg.starts_with("HTTP 500")
                    || msg.starts_with("HTTP 502")
                    || msg.starts_with("HTTP 503")
                    || msg.contains("timed out")
                    || msg.contains("connection reset")
                    || msg.contains("connection refused")
                    || msg.contains("overloaded")
            }
            InferenceError::InvalidResponse(_) => false,
        }
    }
}

impl From<InferenceError> for VigilError {
    fn from(err: InferenceError) -> Self {
        VigilError::Inference(err.to_string())
    }
}

/// Trait implemented by each inference backend.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Name used in logs and the fallback chain.
    fn name(&self) -> &str;

    async fn complete(&self, ctx: &PromptContext, thinking: ThinkingLevel) -> Result<String, InferenceError>;

    /// Cheap reachability probe used by `doctor`.
    async fn health_check(&self) -> Result<(), InferenceError>;
}
