use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use vigil_core::Role;

use crate::provider::*;

/// Any endpoint speaking the OpenAI chat-completions dialect
/// (OpenAI, Ollama, llama.cpp server, vLLM, Together).
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    name: String,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatProvider {
    pub fn new(name: &str, base_url: String, model: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        }
    }

    fn request_body(&self, ctx: &PromptContext, thinking: ThinkingLevel) -> serde_json::Value {
        let mut messages = Vec::with_capacity(ctx.history.len() + 2);
        if let Some(system) = &ctx.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for msg in &ctx.history {
            let role = match msg.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            messages.push(json!({ "role": role, "content": msg.text }));
        }
        messages.push(json!({ "role": "user", "content": ctx.prompt }));

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });
        // Only reasoning-capable servers understand this; others ignore it.
        if matches!(thinking, ThinkingLevel::Medium | ThinkingLevel::High) {
            body["reasoning_effort"] = json!(thinking.as_str());
        }
        body
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {key}")),
            None => req,
        }
    }
}

fn transport_error(e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::ProviderUnavailable(format!("request timed out: {e}"))
    } else if e.is_connect() {
        InferenceError::ProviderUnavailable(format!("connection refused: {e}"))
    } else {
        InferenceError::ProviderUnavailable(e.to_string())
    }
}

/// Pull the assistant text out of a chat-completions response body.
pub fn extract_content(data: &serde_json::Value) -> Result<String, InferenceError> {
    let content = data["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| InferenceError::InvalidResponse("missing choices[0].message.content".into()))?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(InferenceError::InvalidResponse("empty completion".into()));
    }
    Ok(trimmed.to_string())
}

#[async_trait]
impl InferenceProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, ctx: &PromptContext, thinking: ThinkingLevel) -> Result<String, InferenceError> {
        let body = self.request_body(ctx, thinking);
        debug!(provider = %self.name, model = %self.model, thinking = thinking.as_str(), "chat completion request");

        let resp = self
            .authorized(self.client.post(format!("{}/chat/completions", self.base_url)))
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(InferenceError::ProviderUnavailable(format!("HTTP {}: {text}", status.as_u16())));
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| InferenceError::InvalidResponse(e.to_string()))?;
        extract_content(&data)
    }

    async fn health_check(&self) -> Result<(), InferenceError> {
        let resp = self
            .authorized(self.client.get(format!("{}/models", self.base_url)))
            .send()
            .await
            .map_err(transport_error)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(InferenceError::ProviderUnavailable(format!("HTTP {}", resp.status().as_u16())))
        }
    }
}
