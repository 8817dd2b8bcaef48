//! API-invoked agents: direct calls to the Messages endpoint.
//!
//! No process lifecycle to manage. Conversation history for session calls
//! lives in a [`MemoryHistory`] owned by the agent.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::warn;

use super::{Agent, AgentResponse, Attempt, Pricing, RetryPolicy, TokenUsage, with_rate_limit_retry};
use crate::anthropic::{AnthropicError, Message, MessageSender, MessagesRequest};
use crate::error::SessionError;
use crate::session::{ChatMessage, MemoryHistory, Role, SessionContext, SessionContinuity};

#[derive(Debug, Clone)]
pub struct ApiAgentConfig {
    pub name: String,
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    pub timeout: Duration,
    pub pricing: Pricing,
    pub context_window: u64,
    pub retry: RetryPolicy,
    pub history_max_messages: usize,
}

pub struct ApiAgent<S> {
    config: ApiAgentConfig,
    sender: S,
    history: MemoryHistory,
}

impl<S: MessageSender> ApiAgent<S> {
    pub fn new(config: ApiAgentConfig, sender: S) -> Self {
        let history = MemoryHistory::new(config.history_max_messages);
        Self {
            config,
            sender,
            history,
        }
    }

    async fn send(&self, system: Option<String>, messages: Vec<Message>) -> AgentResponse {
        let request = MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            system,
            messages,
        };
        let request = &request;
        with_rate_limit_retry(&self.config.name, self.config.retry, move || {
            self.send_once(request)
        })
        .await
    }

    async fn send_once(&self, request: &MessagesRequest) -> Attempt {
        let started = Instant::now();
        let result =
            tokio::time::timeout(self.config.timeout, self.sender.send_message(request)).await;
        let duration = started.elapsed();
        match result {
            Err(_) => Attempt::Done(AgentResponse::failed(
                format!(
                    "agent '{}' timed out after {:.1}s",
                    self.config.name,
                    self.config.timeout.as_secs_f64()
                ),
                duration,
            )),
            Ok(Err(AnthropicError::RateLimited { retry_after_ms })) => Attempt::RateLimited {
                response: AgentResponse::failed(
                    AnthropicError::RateLimited { retry_after_ms }.to_string(),
                    duration,
                ),
                retry_after_ms: Some(retry_after_ms),
            },
            Ok(Err(e)) => Attempt::Done(AgentResponse::failed(e.to_string(), duration)),
            Ok(Ok(response)) => {
                let text = response.text();
                if text.trim().is_empty() {
                    return Attempt::Done(AgentResponse::failed(
                        format!("agent '{}' returned an empty response", self.config.name),
                        duration,
                    ));
                }
                let tokens =
                    TokenUsage::new(response.usage.input_tokens, response.usage.output_tokens);
                let cost = self.config.pricing.cost(tokens);
                Attempt::Done(AgentResponse::ok(text, tokens, duration).with_cost(cost))
            }
        }
    }
}

/// Splits stored history into the request's system prompt and turn list.
fn to_request_parts(
    base_system: Option<&str>,
    history: &[ChatMessage],
) -> (Option<String>, Vec<Message>) {
    let mut system: Vec<&str> = base_system.into_iter().collect();
    let mut messages = Vec::new();
    for m in history {
        match m.role {
            Role::System => system.push(&m.content),
            Role::User => messages.push(Message::user(m.content.clone())),
            // A trimmed window can open mid-exchange; the API wants a user turn first.
            Role::Assistant if messages.is_empty() => {}
            Role::Assistant => messages.push(Message::assistant(m.content.clone())),
        }
    }
    let system = if system.is_empty() {
        None
    } else {
        Some(system.join("\n\n"))
    };
    (system, messages)
}

#[async_trait]
impl<S: MessageSender + 'static> Agent for ApiAgent<S> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn pricing(&self) -> Pricing {
        self.config.pricing
    }

    fn timeout(&self) -> Duration {
        self.config.timeout
    }

    fn context_window(&self) -> u64 {
        self.config.context_window
    }

    async fn invoke(&self, prompt: &str) -> AgentResponse {
        self.send(
            self.config.system_prompt.clone(),
            vec![Message::user(prompt)],
        )
        .await
    }

    async fn invoke_with_session(&self, session_id: &str, prompt: &str) -> AgentResponse {
        let history = match self.history.context(session_id) {
            SessionContext::History(messages) => messages,
            _ => Vec::new(),
        };
        let (system, mut messages) =
            to_request_parts(self.config.system_prompt.as_deref(), &history);
        messages.push(Message::user(prompt));

        let response = self.send(system, messages).await;
        if let Some(content) = &response.content {
            let exchange = [
                ChatMessage::new(Role::User, prompt).with_tokens(response.tokens.input),
                ChatMessage::new(Role::Assistant, content.as_str())
                    .with_tokens(response.tokens.output),
            ];
            for message in exchange {
                if let Err(e) = self.history.append(session_id, message) {
                    warn!(agent = %self.config.name, error = %e, "failed to record history");
                }
            }
        }
        response.with_session(session_id)
    }

    fn clear_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.history.clear(session_id)
    }
}
