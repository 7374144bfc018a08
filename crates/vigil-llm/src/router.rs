use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::Instant as Deadline;
use tracing::{debug, info, warn};

use crate::provider::{InferenceError, InferenceProvider, PromptContext, ThinkingLevel};

// ── Circuit Breaker ────────────────────────────────────────────

/// Number of consecutive failures before opening the circuit.
const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
/// How long the circuit stays open before allowing a probe request.
const CIRCUIT_OPEN_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    /// Provider is failing; skip it until the open window elapses.
    Open { since: Instant },
    /// One trial request is in flight. A trial that never reports back (its
    /// future was dropped) stops blocking after another open window.
    HalfOpen { since: Instant },
}

#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    open_duration: Duration,
}

impl CircuitBreaker {
    fn new(open_duration: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_duration,
        }
    }

    fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { since } => {
                if since.elapsed() >= self.open_duration {
                    self.state = CircuitState::HalfOpen { since: Instant::now() };
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen { since } => {
                if since.elapsed() >= self.open_duration {
                    debug!("half-open trial never reported back; allowing another");
                    self.state = CircuitState::HalfOpen { since: Instant::now() };
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = CircuitState::Closed;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if matches!(self.state, CircuitState::HalfOpen { .. })
            || self.consecutive_failures >= CIRCUIT_FAILURE_THRESHOLD
        {
            self.state = CircuitState::Open { since: Instant::now() };
        }
    }

    fn is_open(&self) -> bool {
        matches!(self.state, CircuitState::Open { .. })
    }
}

// ── Chain ──────────────────────────────────────────────────────

/// Per-provider attempt budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Wall-clock budget for one attempt against one provider.
    pub attempt_timeout: Duration,
    /// Extra attempts on transient failures before moving on.
    pub retries: u32,
    /// First backoff; doubles each retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_timeout: Duration::from_secs(30),
            retries: 1,
            base_delay: Duration::from_millis(250),
        }
    }
}

/// A successful completion and the provider that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub provider: String,
}

/// Ordered provider fallback. Each provider gets its own timeout, retry
/// budget, and circuit breaker; the first success wins.
#[derive(Clone)]
pub struct ProviderChain {
    providers: Vec<Arc<dyn InferenceProvider>>,
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
    policy: RetryPolicy,
    open_duration: Duration,
}

impl Default for ProviderChain {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl ProviderChain {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            providers: vec![],
            breakers: Arc::new(Mutex::new(HashMap::new())),
            policy,
            open_duration: CIRCUIT_OPEN_DURATION,
        }
    }

    /// Shorten the breaker's open window (tests).
    pub fn with_open_duration(mut self, open_duration: Duration) -> Self {
        self.open_duration = open_duration;
        self
    }

    /// Append a provider to the end of the chain.
    pub fn push(&mut self, provider: Arc<dyn InferenceProvider>) {
        let name = provider.name().to_string();
        info!(provider = %name, position = self.providers.len(), "registered inference provider");
        self.breakers
            .lock()
            .entry(name)
            .or_insert_with(|| CircuitBreaker::new(self.open_duration));
        self.providers.push(provider);
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn providers(&self) -> &[Arc<dyn InferenceProvider>] {
        &self.providers
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Whether a provider's circuit is currently open.
    pub fn is_tripped(&self, provider_name: &str) -> bool {
        self.breakers
            .lock()
            .get(provider_name)
            .is_some_and(|cb| cb.is_open())
    }

    fn is_available(&self, provider_name: &str) -> bool {
        let mut breakers = self.breakers.lock();
        breakers
            .get_mut(provider_name)
            .is_none_or(|cb| cb.allow_request())
    }

    fn record_success(&self, provider_name: &str) {
        if let Some(cb) = self.breakers.lock().get_mut(provider_name) {
            cb.record_success();
        }
    }

    fn record_failure(&self, provider_name: &str) {
        let mut breakers = self.breakers.lock();
        if let Some(cb) = breakers.get_mut(provider_name) {
            let was_open = cb.is_open();
            cb.record_failure();
            if !was_open && cb.is_open() {
                warn!(
                    provider = provider_name,
                    failures = cb.consecutive_failures,
                    "circuit breaker open, provider disabled for {}s",
                    cb.open_duration.as_secs()
                );
            }
        }
    }

    /// Walk the chain in order until one provider answers.
    pub async fn complete(
        &self,
        ctx: &PromptContext,
        thinking: ThinkingLevel,
    ) -> Result<Completion, InferenceError> {
        self.walk(ctx, thinking, None).await
    }

    /// Like [`Self::complete`], but the whole walk must finish within
    /// `budget`. Each attempt is capped at an even share of what is left
    /// across the providers not yet tried, so a hung provider cannot starve
    /// the ones behind it.
    pub async fn complete_within(
        &self,
        ctx: &PromptContext,
        thinking: ThinkingLevel,
        budget: Duration,
    ) -> Result<Completion, InferenceError> {
        self.walk(ctx, thinking, Some(Deadline::now() + budget)).await
    }

    async fn walk(
        &self,
        ctx: &PromptContext,
        thinking: ThinkingLevel,
        deadline: Option<Deadline>,
    ) -> Result<Completion, InferenceError> {
        let mut failures: Vec<String> = Vec::new();

        for (position, provider) in self.providers.iter().enumerate() {
            let name = provider.name();
            if !self.is_available(name) {
                debug!(provider = name, "circuit breaker open, skipping");
                failures.push(format!("{name}: circuit open"));
                continue;
            }
            let remaining_providers = (self.providers.len() - position) as u32;

            match self
                .complete_with_retry(provider.as_ref(), ctx, thinking, deadline, remaining_providers)
                .await
            {
                Ok(text) => {
                    self.record_success(name);
                    return Ok(Completion {
                        text,
                        provider: name.to_string(),
                    });
                }
                Err(e) => {
                    self.record_failure(name);
                    warn!(provider = name, error = %e, "provider failed, falling through");
                    failures.push(format!("{name}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            return Err(InferenceError::ProviderUnavailable("no providers configured".into()));
        }
        Err(InferenceError::ProviderUnavailable(format!(
            "all providers exhausted: {}",
            failures.join("; ")
        )))
    }

    /// Timeout for the next attempt: the policy's, or this provider's share
    /// of the time left before `deadline`.
    fn attempt_budget(&self, deadline: Option<Deadline>, remaining_providers: u32) -> Duration {
        match deadline {
            None => self.policy.attempt_timeout,
            Some(deadline) => {
                let share = deadline.saturating_duration_since(Deadline::now()) / remaining_providers.max(1);
                share.min(self.policy.attempt_timeout)
            }
        }
    }

    /// Retry one provider with exponential backoff on transient errors.
    async fn complete_with_retry(
        &self,
        provider: &dyn InferenceProvider,
        ctx: &PromptContext,
        thinking: ThinkingLevel,
        deadline: Option<Deadline>,
        remaining_providers: u32,
    ) -> Result<String, InferenceError> {
        let mut attempt = 0;
        loop {
            let budget = self.attempt_budget(deadline, remaining_providers);
            if budget.is_zero() {
                return Err(InferenceError::Timeout(budget));
            }
            let outcome = match tokio::time::timeout(budget, provider.complete(ctx, thinking)).await {
                Ok(result) => result,
                Err(_) => Err(InferenceError::Timeout(budget)),
            };

            match outcome {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < self.policy.retries => {
                    let delay = self.policy.base_delay * 2u32.saturating_pow(attempt);
                    if let Some(deadline) = deadline
                        && Deadline::now() + delay >= deadline
                    {
                        return Err(e);
                    }
                    warn!(
                        provider = provider.name(),
                        attempt = attempt + 1,
                        max = self.policy.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
