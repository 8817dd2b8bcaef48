//! Agent invocation contract.
//!
//! An [`Agent`] turns a prompt into text. Two strategies implement it:
//! [`ProcessAgent`] spawns an external executable per call and
//! [`ApiAgent`] calls the Messages API directly. Both go through
//! [`with_rate_limit_retry`] so the orchestrator sees the same failure and
//! backoff behaviour regardless of how the agent is reached.

mod api;
mod process;
mod registry;

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

use crate::error::SessionError;

pub use api::{ApiAgent, ApiAgentConfig};
pub use process::{ProcessAgent, ProcessAgentConfig};
pub use registry::{AgentConfig, AgentEnv, AgentFactory, AgentRegistry};

/// Context window assumed when an agent does not configure one.
pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

/// Input/output token counts for one or more invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input += rhs.input;
        self.output += rhs.output;
    }
}

/// Price per thousand tokens, in dollars.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default)]
    pub input_per_1k: f64,
    #[serde(default)]
    pub output_per_1k: f64,
}

impl Pricing {
    pub fn cost(&self, tokens: TokenUsage) -> f64 {
        (tokens.input as f64 / 1000.0) * self.input_per_1k
            + (tokens.output as f64 / 1000.0) * self.output_per_1k
    }
}

/// Outcome of a single agent call.
///
/// Built only through [`AgentResponse::ok`] and [`AgentResponse::failed`], so
/// `success == true` always comes with content and without an error.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub success: bool,
    pub content: Option<String>,
    pub tokens: TokenUsage,
    pub duration: Duration,
    pub session_id: Option<String>,
    pub cost: Option<f64>,
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn ok(content: String, tokens: TokenUsage, duration: Duration) -> Self {
        Self {
            success: true,
            content: Some(content),
            tokens,
            duration,
            session_id: None,
            cost: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            content: None,
            tokens: TokenUsage::default(),
            duration,
            session_id: None,
            cost: None,
            error: Some(error.into()),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn pricing(&self) -> Pricing;

    /// Upper bound for one call, used as the default fan-out wait.
    fn timeout(&self) -> Duration;

    fn context_window(&self) -> u64 {
        DEFAULT_CONTEXT_WINDOW
    }

    /// How long [`Agent::kill`] may take to settle an in-flight call.
    fn grace_period(&self) -> Duration {
        Duration::ZERO
    }

    /// One-shot call with no memory of previous turns.
    async fn invoke(&self, prompt: &str) -> AgentResponse;

    /// Call that continues the conversation identified by `session_id`.
    async fn invoke_with_session(&self, session_id: &str, prompt: &str) -> AgentResponse;

    /// Token usage for an exchange when the transport did not report one.
    fn extract_tokens(&self, prompt: &str, output: &str) -> TokenUsage {
        TokenUsage::new(estimate_tokens(prompt), estimate_tokens(output))
    }

    fn calculate_cost(&self, tokens: TokenUsage) -> f64 {
        self.pricing().cost(tokens)
    }

    /// Terminates any in-flight call. No-op for agents with nothing external
    /// to stop.
    async fn kill(&self) {}

    fn clear_session(&self, _session_id: &str) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Roughly four characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

static RATE_LIMIT_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"\b429\b",
        r"(?i)rate[\s_-]?limit",
        r"(?i)too many requests",
        r"(?i)quota (exceeded|exhausted)|exceeded (your|the)? ?quota",
        r"(?i)(at|over) capacity|capacity (exceeded|exhausted)",
        r"(?i)overloaded",
    ])
    .expect("rate-limit patterns are valid")
});

/// True when provider output reads like a rate-limit or quota rejection.
pub fn is_rate_limited(text: &str) -> bool {
    RATE_LIMIT_PATTERNS.is_match(text)
}

/// Backoff policy shared by every invocation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt before the failure is surfaced.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Result of one attempt inside [`with_rate_limit_retry`].
pub(crate) enum Attempt {
    Done(AgentResponse),
    RateLimited {
        response: AgentResponse,
        retry_after_ms: Option<u64>,
    },
}

/// Runs `attempt` until it stops reporting a rate limit or the policy's
/// retries are used up. The last rate-limited response is surfaced as an
/// ordinary failure.
pub(crate) async fn with_rate_limit_retry<F, Fut>(
    agent: &str,
    policy: RetryPolicy,
    mut attempt: F,
) -> AgentResponse
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Attempt::Done(response) => return response,
            Attempt::RateLimited {
                mut response,
                retry_after_ms,
            } => {
                if retries >= policy.max_retries {
                    let reason = response.error.take().unwrap_or_default();
                    response.error = Some(format!(
                        "rate limited after {retries} retries: {reason}"
                    ));
                    return response;
                }
                retries += 1;
                let delay_ms = policy
                    .delay_for_attempt(retries)
                    .max(retry_after_ms.unwrap_or(0));
                warn!(
                    agent,
                    attempt = retries,
                    max = policy.max_retries,
                    delay_ms,
                    "rate limited, backing off"
                );
                sleep(Duration::from_millis(delay_ms)).await;
            }
        }
    }
}
