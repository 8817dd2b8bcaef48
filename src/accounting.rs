//! Token and cost accounting across a run.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::agents::TokenUsage;

/// How full an agent's context window is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextHealth {
    Healthy,
    Moderate,
    Warning,
    Critical,
}

impl ContextHealth {
    /// Below 50% is healthy, below 75% moderate, below 90% warning.
    pub fn from_usage(percent: f64) -> Self {
        if percent < 50.0 {
            ContextHealth::Healthy
        } else if percent < 75.0 {
            ContextHealth::Moderate
        } else if percent < 90.0 {
            ContextHealth::Warning
        } else {
            ContextHealth::Critical
        }
    }
}

impl fmt::Display for ContextHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextHealth::Healthy => write!(f, "healthy"),
            ContextHealth::Moderate => write!(f, "moderate"),
            ContextHealth::Warning => write!(f, "warning"),
            ContextHealth::Critical => write!(f, "critical"),
        }
    }
}

/// Cumulative counters for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub invocations: u32,
    pub tokens: TokenUsage,
    pub cost: f64,
    pub context_window: u64,
    /// Tokens accumulated in the agent's session, if it runs one.
    pub session_tokens: u64,
}

impl AgentUsage {
    /// Share of the context window used, in percent. Session calls count
    /// their whole conversation; one-shot agents count their largest call.
    pub fn context_usage_percent(&self) -> f64 {
        if self.context_window == 0 {
            return 0.0;
        }
        self.session_tokens as f64 / self.context_window as f64 * 100.0
    }

    pub fn health(&self) -> ContextHealth {
        ContextHealth::from_usage(self.context_usage_percent())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateUsage {
    pub executions: u32,
    pub tokens: TokenUsage,
    pub cost: f64,
}

/// Run-level totals, broken down by agent and by state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub tokens: TokenUsage,
    pub cost: f64,
    pub invocations: u32,
    pub agents: BTreeMap<String, AgentSummary>,
    pub states: BTreeMap<String, StateUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub invocations: u32,
    pub tokens: TokenUsage,
    pub cost: f64,
    pub context_usage_percent: f64,
    pub health: ContextHealth,
}

#[derive(Debug, Default)]
pub struct TokenTracker {
    agents: BTreeMap<String, AgentUsage>,
    states: BTreeMap<String, StateUsage>,
}

impl TokenTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.agents.clear();
        self.states.clear();
    }

    /// Records one invocation. `session` marks calls that continue a
    /// conversation, whose tokens keep accumulating against the window.
    pub fn record(
        &mut self,
        state: &str,
        agent: &str,
        context_window: u64,
        tokens: TokenUsage,
        cost: f64,
        session: bool,
    ) {
        let usage = self.agents.entry(agent.to_string()).or_default();
        usage.invocations += 1;
        usage.tokens += tokens;
        usage.cost += cost;
        usage.context_window = context_window;
        usage.session_tokens = if session {
            usage.session_tokens + tokens.total()
        } else {
            usage.session_tokens.max(tokens.total())
        };

        let state_usage = self.states.entry(state.to_string()).or_default();
        state_usage.tokens += tokens;
        state_usage.cost += cost;
    }

    /// Counts a state execution, even one that invoked no agents.
    pub fn record_state(&mut self, state: &str) {
        self.states.entry(state.to_string()).or_default().executions += 1;
    }

    pub fn agent(&self, agent: &str) -> Option<&AgentUsage> {
        self.agents.get(agent)
    }

    pub fn summary(&self) -> RunSummary {
        let mut summary = RunSummary::default();
        for (name, usage) in &self.agents {
            summary.tokens += usage.tokens;
            summary.cost += usage.cost;
            summary.invocations += usage.invocations;
            summary.agents.insert(
                name.clone(),
                AgentSummary {
                    invocations: usage.invocations,
                    tokens: usage.tokens,
                    cost: usage.cost,
                    context_usage_percent: usage.context_usage_percent(),
                    health: usage.health(),
                },
            );
        }
        summary.states = self.states.clone();
        summary
    }
}
