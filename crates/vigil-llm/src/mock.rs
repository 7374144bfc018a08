//! Mock inference provider for deterministic testing.
//!
//! Returns pre-configured responses without making any network calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::provider::*;

/// A request as the mock saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub ctx: PromptContext,
    pub thinking: ThinkingLevel,
}

/// A pre-configured response from the mock provider.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub text: String,
    /// Sleep this long before answering.
    pub delay: Option<Duration>,
    /// If set, the provider returns this error instead.
    pub error: Option<InferenceError>,
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            delay: None,
            error: None,
        }
    }

    pub fn error(err: InferenceError) -> Self {
        Self {
            text: String::new(),
            delay: None,
            error: Some(err),
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A mock provider that replays queued responses in order.
///
/// # Example
/// ```
/// use vigil_llm::mock::MockProvider;
/// let provider = MockProvider::new("test").with_response("Hello, world!");
/// ```
pub struct MockProvider {
    name: String,
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    healthy: bool,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            healthy: true,
        }
    }

    /// Queue a simple text response.
    pub fn with_response(self, text: &str) -> Self {
        self.responses.lock().push_back(MockResponse::text(text));
        self
    }

    /// Queue an error response.
    pub fn with_error(self, err: InferenceError) -> Self {
        self.responses.lock().push_back(MockResponse::error(err));
        self
    }

    /// Queue a response that only arrives after `delay`.
    pub fn with_delayed_response(self, text: &str, delay: Duration) -> Self {
        self.responses
            .lock()
            .push_back(MockResponse::text(text).delayed(delay));
        self
    }

    pub fn with_mock_response(self, resp: MockResponse) -> Self {
        self.responses.lock().push_back(resp);
        self
    }

    /// Report failure from `health_check`.
    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    /// Queue a response after construction.
    pub fn queue_response(&self, resp: MockResponse) {
        self.responses.lock().push_back(resp);
    }

    /// Shared handle to every request made to this provider.
    pub fn recorded_requests(&self) -> Arc<Mutex<Vec<RecordedRequest>>> {
        Arc::clone(&self.requests)
    }

    fn next_response(&self) -> MockResponse {
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| MockResponse::text("(mock: no more queued responses)"))
    }
}

#[async_trait]
impl InferenceProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, ctx: &PromptContext, thinking: ThinkingLevel) -> Result<String, InferenceError> {
        self.requests.lock().push(RecordedRequest {
            ctx: ctx.clone(),
            thinking,
        });
        let mock = self.next_response();

        if let Some(delay) = mock.delay {
            tokio::time::sleep(delay).await;
        }
        match mock.error {
            Some(err) => Err(err),
            None => Ok(mock.text),
        }
    }

    async fn health_check(&self) -> Result<(), InferenceError> {
        if self.healthy {
            Ok(())
        } else {
            Err(InferenceError::ProviderUnavailable(format!("{} is down", self.name)))
        }
    }
}
