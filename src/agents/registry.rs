use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use super::{
    Agent, ApiAgent, ApiAgentConfig, DEFAULT_CONTEXT_WINDOW, Pricing, ProcessAgent,
    ProcessAgentConfig, RetryPolicy,
};
use crate::anthropic::AnthropicClient;
use crate::error::AgentError;

/// Per-agent settings from the `[agents.<name>]` tables of a workflow file.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Which factory builds this agent: `process` or `anthropic`.
    #[serde(default = "default_kind")]
    pub kind: String,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub pricing: Pricing,

    #[serde(default = "default_context_window")]
    pub context_window: u64,

    // Process agents.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub model_flag: Option<String>,
    #[serde(default)]
    pub session_pattern: Option<String>,
    #[serde(default)]
    pub resume_flag: Option<String>,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    // API agents.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub system_prompt: Option<String>,

    #[serde(default = "default_history_max_messages")]
    pub history_max_messages: usize,
}

fn default_kind() -> String {
    "process".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_context_window() -> u64 {
    DEFAULT_CONTEXT_WINDOW
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_history_max_messages() -> usize {
    50
}

/// Process-wide settings every factory may need.
#[derive(Debug, Clone, Default)]
pub struct AgentEnv {
    pub api_key: Option<String>,
    pub sessions_dir: PathBuf,
    pub retry: RetryPolicy,
}

pub type AgentFactory =
    Box<dyn Fn(&str, &AgentConfig, &AgentEnv) -> Result<Arc<dyn Agent>, AgentError> + Send + Sync>;

/// Maps agent kinds to constructors. Kinds whose backing dependency is not
/// available (no API key, say) are simply not registered, and asking for
/// them is an [`AgentError::Unsupported`].
pub struct AgentRegistry {
    env: AgentEnv,
    factories: HashMap<String, AgentFactory>,
}

impl AgentRegistry {
    pub fn new(env: AgentEnv) -> Self {
        Self {
            env,
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in `process` factory, plus `anthropic` when an
    /// API key is configured.
    pub fn with_defaults(env: AgentEnv) -> Self {
        let has_key = env.api_key.as_deref().is_some_and(|k| !k.is_empty());
        let mut registry = Self::new(env);
        registry.register("process", Box::new(build_process_agent));
        if has_key {
            registry.register("anthropic", Box::new(build_api_agent));
        } else {
            debug!("no API key configured, anthropic agents unavailable");
        }
        registry
    }

    pub fn register(&mut self, kind: &str, factory: AgentFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn supports(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn build(&self, name: &str, config: &AgentConfig) -> Result<Arc<dyn Agent>, AgentError> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| AgentError::Unsupported {
                name: name.to_string(),
                kind: config.kind.clone(),
            })?;
        let agent = factory(name, config, &self.env)?;
        info!(agent = name, kind = %config.kind, "agent ready");
        Ok(agent)
    }

    pub fn build_all(
        &self,
        configs: &BTreeMap<String, AgentConfig>,
    ) -> Result<HashMap<String, Arc<dyn Agent>>, AgentError> {
        configs
            .iter()
            .map(|(name, config)| Ok((name.clone(), self.build(name, config)?)))
            .collect()
    }
}

fn build_process_agent(
    name: &str,
    config: &AgentConfig,
    env: &AgentEnv,
) -> Result<Arc<dyn Agent>, AgentError> {
    let invalid = |reason: String| AgentError::InvalidConfig {
        name: name.to_string(),
        reason,
    };
    let command = config
        .command
        .clone()
        .ok_or_else(|| invalid("process agents need a command".into()))?;
    let session_pattern = config
        .session_pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| invalid(format!("bad session_pattern: {e}")))?;

    let agent = ProcessAgent::new(ProcessAgentConfig {
        name: name.to_string(),
        command,
        args: config.args.clone(),
        model: config.model.clone(),
        model_flag: config.model_flag.clone(),
        timeout: Duration::from_secs(config.timeout_secs),
        grace_period: Duration::from_secs(config.grace_period_secs),
        pricing: config.pricing,
        context_window: config.context_window,
        retry: env.retry,
        session_pattern,
        resume_flag: config.resume_flag.clone(),
        sessions_dir: env.sessions_dir.clone(),
        history_max_messages: config.history_max_messages,
    })?;
    Ok(Arc::new(agent))
}

fn build_api_agent(
    name: &str,
    config: &AgentConfig,
    env: &AgentEnv,
) -> Result<Arc<dyn Agent>, AgentError> {
    let invalid = |reason: String| AgentError::InvalidConfig {
        name: name.to_string(),
        reason,
    };
    let api_key = env
        .api_key
        .clone()
        .ok_or_else(|| invalid("no API key".into()))?;
    let model = config
        .model
        .clone()
        .ok_or_else(|| invalid("anthropic agents need a model".into()))?;
    let timeout = Duration::from_secs(config.timeout_secs);
    let client = AnthropicClient::new(api_key, timeout).map_err(|e| invalid(e.to_string()))?;

    Ok(Arc::new(ApiAgent::new(
        ApiAgentConfig {
            name: name.to_string(),
            model,
            max_tokens: config.max_tokens,
            system_prompt: config.system_prompt.clone(),
            timeout,
            pricing: config.pricing,
            context_window: config.context_window,
            retry: env.retry,
            history_max_messages: config.history_max_messages,
        },
        client,
    )))
}
