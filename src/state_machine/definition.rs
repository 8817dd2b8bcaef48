//! Declarative workflow graphs, loaded from TOML.
//!
//! ```toml
//! name = "story"
//!
//! [default_transitions]
//! failure = "failed"
//!
//! [states.start]
//! type = "initial"
//! next = "draft"
//!
//! [states.draft]
//! type = "fan_out"
//! agents = ["writer_a", "writer_b"]
//! persona = "novelist"
//! output = "out/{run_id}/{state}-{agent}.md"
//! transitions = { all_success = "audit", partial_success = "audit" }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::audit::is_audit_output;
use crate::agents::AgentConfig;
use crate::circuit_breaker::{BreakerConfig, SafetyLimits};
use crate::error::{QuillError, WorkflowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Initial,
    #[serde(alias = "fan-out")]
    FanOut,
    Single,
    #[serde(alias = "orchestrator-task")]
    OrchestratorTask,
    #[serde(alias = "human-approval")]
    HumanApproval,
    Terminal,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateKind::Initial => write!(f, "initial"),
            StateKind::FanOut => write!(f, "fan_out"),
            StateKind::Single => write!(f, "single"),
            StateKind::OrchestratorTask => write!(f, "orchestrator_task"),
            StateKind::HumanApproval => write!(f, "human_approval"),
            StateKind::Terminal => write!(f, "terminal"),
        }
    }
}

/// How a terminal state ends the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalOutcome {
    #[default]
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDef {
    #[serde(rename = "type")]
    pub kind: StateKind,

    /// Agent for `single` and `orchestrator_task` states.
    #[serde(default)]
    pub agent: Option<String>,

    /// Agents for `fan_out` states.
    #[serde(default)]
    pub agents: Vec<String>,

    /// Persona shared by every agent of the state.
    #[serde(default)]
    pub persona: Option<String>,

    /// Per-agent persona overrides.
    #[serde(default)]
    pub personas: BTreeMap<String, String>,

    /// Task instructions appended after the persona.
    #[serde(default)]
    pub prompt: Option<String>,

    /// Input file path templates read into the prompt.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// States whose latest outputs are included. Defaults to the previous state.
    #[serde(default)]
    pub context_from: Vec<String>,

    /// Output file path template, written best-effort.
    #[serde(default)]
    pub output: Option<String>,

    #[serde(default)]
    pub output_type: Option<String>,

    #[serde(default)]
    pub transitions: BTreeMap<String, String>,

    /// Shorthand for the `next` transition.
    #[serde(default)]
    pub next: Option<String>,

    /// Per-agent wait limit for this state, overriding the agent's own timeout.
    #[serde(default)]
    pub timeout_secs: Option<f64>,

    /// Only meaningful on terminal states.
    #[serde(default)]
    pub outcome: TerminalOutcome,
}

impl StateDef {
    pub fn new(kind: StateKind) -> Self {
        Self {
            kind,
            agent: None,
            agents: Vec::new(),
            persona: None,
            personas: BTreeMap::new(),
            prompt: None,
            inputs: Vec::new(),
            context_from: Vec::new(),
            output: None,
            output_type: None,
            transitions: BTreeMap::new(),
            next: None,
            timeout_secs: None,
            outcome: TerminalOutcome::default(),
        }
    }

    /// Agents this state invokes, in declaration order.
    pub fn agent_names(&self) -> Vec<&str> {
        match self.kind {
            StateKind::FanOut => self.agents.iter().map(String::as_str).collect(),
            StateKind::Single | StateKind::OrchestratorTask => {
                self.agent.as_deref().into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn is_audit(&self) -> bool {
        self.output_type.as_deref().is_some_and(is_audit_output)
    }

    pub fn persona_for(&self, agent: &str) -> Option<&str> {
        self.personas
            .get(agent)
            .map(String::as_str)
            .or(self.persona.as_deref())
    }

    fn own_transition(&self, label: &str) -> Option<&str> {
        self.transitions
            .get(label)
            .map(String::as_str)
            .or_else(|| (label == "next").then_some(self.next.as_deref()).flatten())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Entry state. Defaults to the first `initial` state.
    #[serde(default)]
    pub start: Option<String>,

    /// State that breaker guidance loops back to. Defaults to the first
    /// `orchestrator_task` state.
    #[serde(default)]
    pub synthesis_state: Option<String>,

    /// Minimum audit score that lets a soft break skip forward unattended.
    #[serde(default)]
    pub auto_skip_score: Option<u8>,

    #[serde(default)]
    pub approval_timeout_secs: Option<u64>,

    #[serde(default)]
    pub default_transitions: BTreeMap<String, String>,

    #[serde(default)]
    pub circuit_breaker: BreakerConfig,

    #[serde(default)]
    pub safety_limits: SafetyLimits,

    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,

    pub states: BTreeMap<String, StateDef>,
}

impl WorkflowDefinition {
    pub fn load(path: &Path) -> Result<Self, QuillError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, QuillError> {
        let workflow: Self = toml::from_str(contents)?;
        workflow.validate()?;
        Ok(workflow)
    }

    pub fn state(&self, name: &str) -> Option<&StateDef> {
        self.states.get(name)
    }

    /// State-specific transitions win; run-level defaults fill the gaps.
    pub fn resolve_transition(&self, state: &str, label: &str) -> Option<&str> {
        self.states
            .get(state)
            .and_then(|def| def.own_transition(label))
            .or_else(|| self.default_transitions.get(label).map(String::as_str))
    }

    pub fn start_state(&self) -> Option<&str> {
        self.start.as_deref().or_else(|| self.first_of(StateKind::Initial))
    }

    pub fn synthesis_state(&self) -> Option<&str> {
        self.synthesis_state
            .as_deref()
            .or_else(|| self.first_of(StateKind::OrchestratorTask))
    }

    fn first_of(&self, kind: StateKind) -> Option<&str> {
        self.states
            .iter()
            .find(|(_, def)| def.kind == kind)
            .map(|(name, _)| name.as_str())
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.states.is_empty() {
            return Err(WorkflowError::Empty);
        }
        self.safety_limits.validate(&self.circuit_breaker)?;

        let check_target = |state: &str, label: &str, target: &str| {
            if self.states.contains_key(target) {
                Ok(())
            } else {
                Err(WorkflowError::UnknownTarget {
                    state: state.to_string(),
                    label: label.to_string(),
                    target: target.to_string(),
                })
            }
        };

        for (label, target) in &self.default_transitions {
            check_target("*", label.as_str(), target.as_str())?;
        }
        for name in [&self.start, &self.synthesis_state].into_iter().flatten() {
            check_target("*", "start", name.as_str())?;
        }

        for (name, def) in &self.states {
            for (label, target) in &def.transitions {
                check_target(name.as_str(), label.as_str(), target.as_str())?;
            }
            if let Some(next) = &def.next {
                check_target(name.as_str(), "next", next.as_str())?;
            }
            for source in &def.context_from {
                check_target(name.as_str(), "context_from", source.as_str())?;
            }

            match def.kind {
                StateKind::FanOut if def.agents.is_empty() => {
                    return Err(WorkflowError::EmptyFanOut(name.clone()));
                }
                StateKind::Single | StateKind::OrchestratorTask if def.agent.is_none() => {
                    return Err(WorkflowError::MissingAgent(name.clone()));
                }
                _ => {}
            }
            if let Some(secs) = def.timeout_secs {
                if secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                    return Err(WorkflowError::InvalidTimeout {
                        state: name.clone(),
                        value: secs.to_string(),
                    });
                }
            }
            let mut seen = BTreeSet::new();
            for agent in &def.agents {
                if !seen.insert(agent.as_str()) {
                    return Err(WorkflowError::DuplicateAgent {
                        state: name.clone(),
                        agent: agent.clone(),
                    });
                }
            }
            for agent in def.agent_names() {
                if !self.agents.contains_key(agent) {
                    return Err(WorkflowError::UnknownAgent {
                        state: name.clone(),
                        agent: agent.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
