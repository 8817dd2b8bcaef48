//! Safety rules over transition history.
//!
//! Soft rules ([`BreakerConfig`]) may be overridden by the orchestrator
//! (auto-skip, human decision). Hard limits ([`SafetyLimits`]) are strictly
//! larger and always end the run.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::WorkflowError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_max_state_visits")]
    pub max_state_visits: u32,
    #[serde(default = "default_max_transitions")]
    pub max_transitions: u32,
    #[serde(default = "default_max_runtime_secs")]
    pub max_runtime_secs: u64,
    #[serde(default = "default_max_cost")]
    pub max_cost: f64,
    #[serde(default = "default_detect_cycles")]
    pub detect_cycles: bool,
}

fn default_max_state_visits() -> u32 {
    5
}

fn default_max_transitions() -> u32 {
    50
}

fn default_max_runtime_secs() -> u64 {
    2 * 60 * 60
}

fn default_max_cost() -> f64 {
    25.0
}

fn default_detect_cycles() -> bool {
    true
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_state_visits: default_max_state_visits(),
            max_transitions: default_max_transitions(),
            max_runtime_secs: default_max_runtime_secs(),
            max_cost: default_max_cost(),
            detect_cycles: default_detect_cycles(),
        }
    }
}

/// Non-overridable ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    #[serde(default = "default_hard_state_visits")]
    pub max_state_visits: u32,
    #[serde(default = "default_hard_transitions")]
    pub max_transitions: u32,
    #[serde(default = "default_hard_runtime_secs")]
    pub max_runtime_secs: u64,
    #[serde(default = "default_hard_cost")]
    pub max_cost: f64,
}

fn default_hard_state_visits() -> u32 {
    15
}

fn default_hard_transitions() -> u32 {
    150
}

fn default_hard_runtime_secs() -> u64 {
    6 * 60 * 60
}

fn default_hard_cost() -> f64 {
    100.0
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_state_visits: default_hard_state_visits(),
            max_transitions: default_hard_transitions(),
            max_runtime_secs: default_hard_runtime_secs(),
            max_cost: default_hard_cost(),
        }
    }
}

impl SafetyLimits {
    /// Every hard limit must sit strictly above its soft counterpart.
    pub fn validate(&self, soft: &BreakerConfig) -> Result<(), WorkflowError> {
        if self.max_state_visits <= soft.max_state_visits {
            return Err(WorkflowError::SafetyLimitTooLow("max_state_visits"));
        }
        if self.max_transitions <= soft.max_transitions {
            return Err(WorkflowError::SafetyLimitTooLow("max_transitions"));
        }
        if self.max_runtime_secs <= soft.max_runtime_secs {
            return Err(WorkflowError::SafetyLimitTooLow("max_runtime_secs"));
        }
        if self.max_cost <= soft.max_cost {
            return Err(WorkflowError::SafetyLimitTooLow("max_cost"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakRule {
    StateVisitLimit,
    CycleDetection,
    TransitionLimit,
    TimeLimit,
    CostLimit,
}

impl fmt::Display for BreakRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakRule::StateVisitLimit => write!(f, "state_visit_limit"),
            BreakRule::CycleDetection => write!(f, "cycle_detection"),
            BreakRule::TransitionLimit => write!(f, "transition_limit"),
            BreakRule::TimeLimit => write!(f, "time_limit"),
            BreakRule::CostLimit => write!(f, "cost_limit"),
        }
    }
}

/// Point-in-time copy of the breaker's context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub visit_counts: BTreeMap<String, u32>,
    pub history: Vec<(String, String)>,
    pub transition_count: u32,
    pub elapsed_secs: f64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakEvent {
    pub rule: BreakRule,
    pub message: String,
    /// Hard safety limit: never overridden.
    pub hard: bool,
    pub snapshot: BreakerSnapshot,
}

#[derive(Debug)]
struct BreakerContext {
    visit_counts: BTreeMap<String, u32>,
    history: Vec<(String, String)>,
    transition_count: u32,
    started: Instant,
    total_cost: f64,
}

impl BreakerContext {
    fn new() -> Self {
        Self {
            visit_counts: BTreeMap::new(),
            history: Vec::new(),
            transition_count: 0,
            started: Instant::now(),
            total_cost: 0.0,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    limits: SafetyLimits,
    ctx: BreakerContext,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, limits: SafetyLimits) -> Self {
        Self {
            config,
            limits,
            ctx: BreakerContext::new(),
        }
    }

    /// Clears everything, including the clock and cost. Called per run.
    pub fn reset(&mut self) {
        self.ctx = BreakerContext::new();
    }

    /// Clears visit counts and history after a human override, keeping the
    /// run's clock and cost so the time and cost ceilings still hold.
    pub fn reset_counters(&mut self) {
        self.ctx.visit_counts.clear();
        self.ctx.history.clear();
        self.ctx.transition_count = 0;
    }

    /// Rewrites the target of the last recorded transition, for when the
    /// run moves somewhere other than what [`CircuitBreaker::check`] saw.
    pub fn redirect_last(&mut self, to: &str) {
        let Some(last) = self.ctx.history.last_mut() else {
            return;
        };
        if last.1 == to {
            return;
        }
        let previous = std::mem::replace(&mut last.1, to.to_string());
        if let Some(count) = self.ctx.visit_counts.get_mut(&previous) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.ctx.visit_counts.remove(&previous);
            }
        }
        *self.ctx.visit_counts.entry(to.to_string()).or_insert(0) += 1;
    }

    pub fn add_cost(&mut self, cost: f64) {
        self.ctx.total_cost += cost;
    }

    pub fn visit_count(&self, state: &str) -> u32 {
        self.ctx.visit_counts.get(state).copied().unwrap_or(0)
    }

    pub fn transition_count(&self) -> u32 {
        self.ctx.transition_count
    }

    pub fn total_cost(&self) -> f64 {
        self.ctx.total_cost
    }

    pub fn elapsed(&self) -> Duration {
        self.ctx.started.elapsed()
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            visit_counts: self.ctx.visit_counts.clone(),
            history: self.ctx.history.clone(),
            transition_count: self.ctx.transition_count,
            elapsed_secs: self.elapsed().as_secs_f64(),
            total_cost: self.ctx.total_cost,
        }
    }

    /// Evaluates the hard ceilings against the candidate transition without
    /// recording it.
    pub fn check_hard_limits(&self, _from: &str, to: &str) -> Option<BreakEvent> {
        let visits = self.visit_count(to) + 1;
        let transitions = self.ctx.transition_count + 1;
        let elapsed = self.elapsed();
        let (rule, message) = if visits >= self.limits.max_state_visits {
            (
                BreakRule::StateVisitLimit,
                format!(
                    "hard limit: state '{to}' would be visited {visits} times (limit {})",
                    self.limits.max_state_visits
                ),
            )
        } else if transitions > self.limits.max_transitions {
            (
                BreakRule::TransitionLimit,
                format!(
                    "hard limit: {transitions} transitions exceed {}",
                    self.limits.max_transitions
                ),
            )
        } else if elapsed > Duration::from_secs(self.limits.max_runtime_secs) {
            (
                BreakRule::TimeLimit,
                format!(
                    "hard limit: runtime {:.0}s exceeds {}s",
                    elapsed.as_secs_f64(),
                    self.limits.max_runtime_secs
                ),
            )
        } else if self.ctx.total_cost > self.limits.max_cost {
            (
                BreakRule::CostLimit,
                format!(
                    "hard limit: cost ${:.2} exceeds ${:.2}",
                    self.ctx.total_cost, self.limits.max_cost
                ),
            )
        } else {
            return None;
        };
        warn!(%rule, %message, "hard safety limit tripped");
        Some(BreakEvent {
            rule,
            message,
            hard: true,
            snapshot: self.snapshot(),
        })
    }

    /// Records `from -> to` and evaluates the soft rules.
    pub fn check(&mut self, from: &str, to: &str) -> Option<BreakEvent> {
        self.ctx.history.push((from.to_string(), to.to_string()));
        self.ctx.transition_count += 1;
        *self.ctx.visit_counts.entry(to.to_string()).or_insert(0) += 1;
        debug_assert_eq!(self.ctx.transition_count as usize, self.ctx.history.len());

        let (rule, message) = self.evaluate(to)?;
        warn!(%rule, %message, "circuit breaker tripped");
        Some(BreakEvent {
            rule,
            message,
            hard: false,
            snapshot: self.snapshot(),
        })
    }

    fn evaluate(&self, to: &str) -> Option<(BreakRule, String)> {
        let visits = self.visit_count(to);
        if visits >= self.config.max_state_visits {
            return Some((
                BreakRule::StateVisitLimit,
                format!(
                    "state '{to}' visited {visits} times (limit {})",
                    self.config.max_state_visits
                ),
            ));
        }
        if self.config.detect_cycles {
            if let Some((a, b)) = self.detect_cycle() {
                return Some((
                    BreakRule::CycleDetection,
                    format!("cycle detected: {a} -> {b} -> {a} -> {b}"),
                ));
            }
        }
        if self.ctx.transition_count > self.config.max_transitions {
            return Some((
                BreakRule::TransitionLimit,
                format!(
                    "{} transitions exceed {}",
                    self.ctx.transition_count, self.config.max_transitions
                ),
            ));
        }
        let elapsed = self.elapsed();
        if elapsed > Duration::from_secs(self.config.max_runtime_secs) {
            return Some((
                BreakRule::TimeLimit,
                format!(
                    "runtime {:.0}s exceeds {}s",
                    elapsed.as_secs_f64(),
                    self.config.max_runtime_secs
                ),
            ));
        }
        if self.ctx.total_cost > self.config.max_cost {
            return Some((
                BreakRule::CostLimit,
                format!(
                    "cost ${:.2} exceeds ${:.2}",
                    self.ctx.total_cost, self.config.max_cost
                ),
            ));
        }
        None
    }

    /// The last four transitions are exactly A->B, B->A, A->B, B->A.
    fn detect_cycle(&self) -> Option<(&str, &str)> {
        let history = &self.ctx.history;
        if history.len() < 4 {
            return None;
        }
        let window = &history[history.len() - 4..];
        let (a, b) = (&window[0].0, &window[0].1);
        if a == b {
            return None;
        }
        let forward = (a.as_str(), b.as_str());
        let back = (b.as_str(), a.as_str());
        let matches = |i: usize, expected: (&str, &str)| {
            (window[i].0.as_str(), window[i].1.as_str()) == expected
        };
        if matches(1, back) && matches(2, forward) && matches(3, back) {
            Some(forward)
        } else {
            None
        }
    }
}
