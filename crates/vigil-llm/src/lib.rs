//! # vigil-llm
//!
//! Abstraction over inference providers. The cognition layer talks to a
//! [`ProviderChain`], which walks an ordered list of providers with per-call
//! timeouts, retries on transient failures, and a circuit breaker per provider.

pub mod command;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod router;

pub use command::CommandProvider;
pub use mock::MockProvider;
pub use openai::OpenAiCompatProvider;
pub use provider::{InferenceError, InferenceProvider, PromptContext, ThinkingLevel};
pub use router::{Completion, ProviderChain, RetryPolicy};

use std::sync::Arc;

use vigil_config::{ProviderConfig, ProviderKind};
use vigil_core::{Result, VigilError};

/// Build a provider from its config entry.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn InferenceProvider>> {
    match config.kind {
        ProviderKind::OpenAi => {
            let base_url = config.base_url.clone().ok_or_else(|| VigilError::ConfigurationMissing {
                what: format!("providers.{}.base_url", config.name),
                hint: "set base_url to an OpenAI-compatible endpoint".into(),
            })?;
            let model = config.model.clone().ok_or_else(|| VigilError::ConfigurationMissing {
                what: format!("providers.{}.model", config.name),
                hint: "set model, e.g. model = \"llama3\"".into(),
            })?;
            Ok(Arc::new(OpenAiCompatProvider::new(
                &config.name,
                base_url,
                model,
                config.resolved_api_key(),
            )))
        }
        ProviderKind::Command => {
            let program = config.command.clone().ok_or_else(|| VigilError::ConfigurationMissing {
                what: format!("providers.{}.command", config.name),
                hint: "set command to an executable that reads the prompt on stdin".into(),
            })?;
            Ok(Arc::new(CommandProvider::new(
                &config.name,
                program,
                config.args.clone(),
            )))
        }
    }
}
