use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::audit::AuditAggregate;
use crate::accounting::RunSummary;
use crate::agents::{AgentResponse, TokenUsage};

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Complete,
    Failed,
    #[serde(rename = "halt")]
    Halted,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Complete => write!(f, "complete"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Halted => write!(f, "halt"),
        }
    }
}

/// One run of a workflow. Frozen once it reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub current_state: Option<String>,
    pub final_state: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tokens: TokenUsage,
    pub cost: f64,
}

impl WorkflowRun {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            current_state: None,
            final_state: None,
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            tokens: TokenUsage::default(),
            cost: 0.0,
        }
    }

    pub fn enter(&mut self, state: &str) {
        if !self.status.is_terminal() {
            self.current_state = Some(state.to_string());
        }
    }

    pub fn add_usage(&mut self, tokens: TokenUsage, cost: f64) {
        if !self.status.is_terminal() {
            self.tokens += tokens;
            self.cost += cost;
        }
    }

    /// Moves to a terminal status. Returns false if already terminal.
    pub fn finish(&mut self, status: RunStatus, final_state: Option<&str>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.final_state = final_state.map(str::to_string);
        self.completed_at = Some(Utc::now());
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanOutStatus {
    Success,
    Failed,
    Timeout,
}

/// One agent's contribution to a state. Successful results always carry
/// content and never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutResult {
    agent: String,
    status: FanOutStatus,
    output_path: Option<String>,
    content: Option<String>,
    tokens: TokenUsage,
    cost: f64,
    duration: Duration,
    error: Option<String>,
}

impl FanOutResult {
    pub fn success(
        agent: impl Into<String>,
        content: impl Into<String>,
        tokens: TokenUsage,
        cost: f64,
        duration: Duration,
    ) -> Self {
        Self {
            agent: agent.into(),
            status: FanOutStatus::Success,
            output_path: None,
            content: Some(content.into()),
            tokens,
            cost,
            duration,
            error: None,
        }
    }

    pub fn failed(agent: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            agent: agent.into(),
            status: FanOutStatus::Failed,
            output_path: None,
            content: None,
            tokens: TokenUsage::default(),
            cost: 0.0,
            duration,
            error: Some(error.into()),
        }
    }

    pub fn timeout(agent: impl Into<String>, limit: Duration) -> Self {
        let agent = agent.into();
        let error = format!("agent '{agent}' timed out after {:.1}s", limit.as_secs_f64());
        Self {
            status: FanOutStatus::Timeout,
            ..Self::failed(agent, error, limit)
        }
    }

    /// Converts an agent response. A response claiming success without
    /// content is treated as a failure.
    pub fn from_response(agent: impl Into<String>, response: AgentResponse, cost: f64) -> Self {
        let agent = agent.into();
        match response.content {
            Some(content) if response.success => {
                Self::success(agent, content, response.tokens, cost, response.duration)
            }
            _ => {
                let error = response
                    .error
                    .unwrap_or_else(|| format!("agent '{agent}' returned no content"));
                Self {
                    tokens: response.tokens,
                    cost,
                    ..Self::failed(agent, error, response.duration)
                }
            }
        }
    }

    pub fn with_output_path(mut self, path: impl Into<String>) -> Self {
        if self.is_success() {
            self.output_path = Some(path.into());
        }
        self
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn status(&self) -> FanOutStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == FanOutStatus::Success
    }

    pub fn content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    pub fn output_path(&self) -> Option<&str> {
        self.output_path.as_deref()
    }

    pub fn tokens(&self) -> TokenUsage {
        self.tokens
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

/// Outcome of executing one state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateResult {
    pub state: String,
    pub transition: String,
    pub results: BTreeMap<String, FanOutResult>,
    pub duration: Duration,
    pub tokens: TokenUsage,
    pub cost: f64,
    pub audit: Option<AuditAggregate>,
    pub error: Option<String>,
}

impl StateResult {
    pub fn new(state: impl Into<String>, transition: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            transition: transition.into(),
            results: BTreeMap::new(),
            duration: Duration::ZERO,
            tokens: TokenUsage::default(),
            cost: 0.0,
            audit: None,
            error: None,
        }
    }

    pub fn with_results(mut self, results: Vec<FanOutResult>) -> Self {
        for result in results {
            self.tokens += result.tokens;
            self.cost += result.cost;
            self.results.insert(result.agent.clone(), result);
        }
        self
    }

    /// Count-based label for non-audit fan-outs.
    pub fn fan_out_label(&self) -> &'static str {
        let succeeded = self.results.values().filter(|r| r.is_success()).count();
        if succeeded == self.results.len() && succeeded > 0 {
            "all_success"
        } else if succeeded > 0 {
            "partial_success"
        } else {
            "all_failure"
        }
    }

    pub fn first_error(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or_else(|| self.results.values().find_map(|r| r.error()))
    }
}

/// What `run` hands back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub final_state: Option<String>,
    /// State in which the run failed or halted.
    pub failed_state: Option<String>,
    pub error: Option<String>,
    /// Set when the user aborted, as opposed to an automatic halt.
    pub aborted: bool,
    pub summary: RunSummary,
    pub history: Vec<StateResult>,
}
