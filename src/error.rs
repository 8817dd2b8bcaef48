use thiserror::Error;

pub use crate::anthropic::AnthropicError;

#[derive(Debug, Error)]
pub enum QuillError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Anthropic API error: {0}")]
    Anthropic(#[from] AnthropicError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Problems found while validating a workflow definition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("workflow has no states")]
    Empty,

    #[error("state '{state}' transition '{label}' targets unknown state '{target}'")]
    UnknownTarget {
        state: String,
        label: String,
        target: String,
    },

    #[error("state '{state}' references unknown agent '{agent}'")]
    UnknownAgent { state: String, agent: String },

    #[error("state '{0}' requires an agent")]
    MissingAgent(String),

    #[error("fan-out state '{0}' lists no agents")]
    EmptyFanOut(String),

    #[error("hard safety limit '{0}' must be strictly larger than its soft threshold")]
    SafetyLimitTooLow(&'static str),

    #[error("state '{state}' timeout_secs = {value} is not a usable duration")]
    InvalidTimeout { state: String, value: String },

    #[error("fan-out state '{state}' lists agent '{agent}' more than once")]
    DuplicateAgent { state: String, agent: String },
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unsupported agent kind '{kind}' for agent '{name}'")]
    Unsupported { name: String, kind: String },

    #[error("agent '{0}' is not configured")]
    NotConfigured(String),

    #[error("invalid agent config for '{name}': {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("run not initialized. Call `initialize` first.")]
    NotInitialized,

    #[error("no approval is pending")]
    NoPendingApproval,
}

/// Schema violations in an audit verdict.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit score {0} is outside 1..=10")]
    ScoreOutOfRange(i64),

    #[error("no JSON object found in audit output")]
    NoJson,

    #[error("invalid audit JSON: {0}")]
    Invalid(String),
}
