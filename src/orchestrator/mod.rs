//! The run loop: executes workflow states, resolves transitions, consults
//! the circuit breaker and records every invocation.

mod collaborators;
mod context;
mod control;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accounting::TokenTracker;
use crate::agents::{Agent, DEFAULT_CONTEXT_WINDOW};
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{AgentError, OrchestratorError};
use crate::state_machine::{
    AuditAggregate, AuditResult, Decision, FanOutResult, RunOutcome, RunStatus, StateDef,
    StateKind, StateResult, TerminalOutcome, WorkflowDefinition, WorkflowRun, parse_audit,
};

pub use collaborators::{
    ApprovalNotifier, ApprovalReason, ApprovalRequest, DirPersonaResolver, EventSink,
    JsonlOutputStore, MemoryOutputStore, MemorySink, NullSink, OutputRecord, OutputStore,
    PersonaResolver, StaticPersonas, WorkflowEvent,
};
pub use context::{
    AUDITOR_FEEDBACK_TAG, FeedbackSource, PendingFeedback, USER_FEEDBACK_TAG, compose_prompt,
    render_template,
};
pub use control::{ApprovalDecision, ApprovalResponse, ControlState, RunHandle};

use collaborators::write_output_file;
use context::PromptParts;
use control::ApprovalWait;

pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_AUTO_SKIP_SCORE: u8 = 8;

/// Labels tried, in order, when skipping forward past a soft break.
const FORWARD_LABELS: [&str; 2] = ["proceed", "success"];

/// Why the loop stopped before reaching a terminal state.
#[derive(Debug)]
struct Halt {
    error: String,
    aborted: bool,
}

impl Halt {
    fn error(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            aborted: false,
        }
    }

    fn aborted() -> Self {
        Self::aborted_because("aborted by user")
    }

    fn aborted_because(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            aborted: true,
        }
    }
}

/// Everything scoped to one run. Owned by the loop, never shared with workers.
struct RunContext {
    run: WorkflowRun,
    breaker: CircuitBreaker,
    tracker: TokenTracker,
    pending: HashMap<String, Vec<PendingFeedback>>,
    outputs: HashMap<String, Vec<(String, String)>>,
    previous: Option<String>,
    last_prompt: String,
    last_audit_score: Option<u8>,
    last_audits: Vec<(String, AuditResult)>,
    history: Vec<StateResult>,
}

impl RunContext {
    fn new(run_id: String, workflow: &WorkflowDefinition) -> Self {
        Self {
            run: WorkflowRun::new(run_id),
            breaker: CircuitBreaker::new(
                workflow.circuit_breaker.clone(),
                workflow.safety_limits.clone(),
            ),
            tracker: TokenTracker::new(),
            pending: HashMap::new(),
            outputs: HashMap::new(),
            previous: None,
            last_prompt: String::new(),
            last_audit_score: None,
            last_audits: Vec::new(),
            history: Vec::new(),
        }
    }

    fn add_feedback(&mut self, state: &str, feedback: PendingFeedback) {
        self.pending
            .entry(state.to_string())
            .or_default()
            .push(feedback);
    }
}

struct Worker {
    agent_name: String,
    agent: Arc<dyn Agent>,
    handle: JoinHandle<FanOutResult>,
}

type Step = Result<(String, TerminalOutcome), (String, Halt)>;

pub struct Orchestrator {
    workflow: WorkflowDefinition,
    agents: HashMap<String, Arc<dyn Agent>>,
    personas: Arc<dyn PersonaResolver>,
    outputs: Arc<dyn OutputStore>,
    events: Arc<dyn EventSink>,
    notifier: Option<Arc<dyn ApprovalNotifier>>,
    handle: RunHandle,
    approval_timeout: Duration,
    auto_skip_score: u8,
    run: Option<RunContext>,
}

impl Orchestrator {
    pub fn new(workflow: WorkflowDefinition, agents: HashMap<String, Arc<dyn Agent>>) -> Self {
        let approval_timeout = workflow
            .approval_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_APPROVAL_TIMEOUT);
        let auto_skip_score = workflow.auto_skip_score.unwrap_or(DEFAULT_AUTO_SKIP_SCORE);
        Self {
            workflow,
            agents,
            personas: Arc::new(StaticPersonas::new()),
            outputs: Arc::new(MemoryOutputStore::new()),
            events: Arc::new(NullSink),
            notifier: None,
            handle: RunHandle::new(),
            approval_timeout,
            auto_skip_score,
            run: None,
        }
    }

    pub fn with_personas(mut self, personas: Arc<dyn PersonaResolver>) -> Self {
        self.personas = personas;
        self
    }

    pub fn with_output_store(mut self, outputs: Arc<dyn OutputStore>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Enables approval notifications, and with them human override of
    /// soft circuit breaks.
    pub fn with_approval_notifier(mut self, notifier: Arc<dyn ApprovalNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    pub fn with_auto_skip_score(mut self, score: u8) -> Self {
        self.auto_skip_score = score;
        self
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    /// Control surface for other tasks. Stays valid across runs.
    pub fn handle(&self) -> RunHandle {
        self.handle.clone()
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run.as_ref().map(|ctx| ctx.run.run_id.as_str())
    }

    pub fn initialize(&mut self, run_id: impl Into<String>) {
        let run_id = run_id.into();
        info!(run_id = %run_id, workflow = %self.workflow.name, "run initialized");
        self.handle.reset();
        self.run = Some(RunContext::new(run_id, &self.workflow));
    }

    pub fn pause(&self) {
        self.handle.pause();
    }

    pub fn resume(&self) {
        self.handle.resume();
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn submit_approval(
        &self,
        decision: ApprovalDecision,
        feedback: Option<String>,
    ) -> Result<(), OrchestratorError> {
        self.handle.submit_approval(decision, feedback)
    }

    /// Runs from `start` (or the workflow's entry state) to a terminal
    /// status. Requires a prior `initialize`; each run consumes it.
    pub async fn run(&mut self, start: Option<&str>) -> Result<RunOutcome, OrchestratorError> {
        let mut ctx = self.run.take().ok_or(OrchestratorError::NotInitialized)?;
        ctx.breaker.reset();
        ctx.tracker.reset();

        let start = start
            .or_else(|| self.workflow.start_state())
            .map(str::to_string);
        let step = match start {
            Some(start) => {
                info!(run_id = %ctx.run.run_id, start = %start, "run started");
                self.emit(WorkflowEvent::RunStarted {
                    run_id: ctx.run.run_id.clone(),
                    start: start.clone(),
                });
                self.drive(&mut ctx, start).await
            }
            None => Err((String::new(), Halt::error("workflow has no start state"))),
        };
        Ok(self.finish(ctx, step))
    }

    async fn drive(&self, ctx: &mut RunContext, start: String) -> Step {
        let mut current = start;
        loop {
            if !self.checkpoint().await {
                return Err((current, Halt::aborted()));
            }
            let Some(def) = self.workflow.state(&current) else {
                let message = format!("unknown state '{current}'");
                return Err((current, Halt::error(message)));
            };

            ctx.run.enter(&current);
            info!(run_id = %ctx.run.run_id, state = %current, kind = %def.kind, "entering state");
            self.emit(WorkflowEvent::StateEntered {
                state: current.clone(),
                kind: def.kind.to_string(),
            });
            if def.kind == StateKind::Terminal {
                return Ok((current, def.outcome));
            }

            ctx.tracker.record_state(&current);
            let feedback = ctx.pending.remove(&current).unwrap_or_default();
            let started = Instant::now();
            let mut result = match self.execute(ctx, &current, def, &feedback).await {
                Ok(result) => result,
                Err(halt) => return Err((current, halt)),
            };
            result.duration = started.elapsed();

            let succeeded = result.results.values().filter(|r| r.is_success()).count();
            self.emit(WorkflowEvent::StateCompleted {
                state: current.clone(),
                transition: result.transition.clone(),
                succeeded,
                failed: result.results.len() - succeeded,
                cost: result.cost,
            });

            if self.handle.is_aborted() {
                ctx.history.push(result);
                return Err((current, Halt::aborted()));
            }

            let label = result.transition.clone();
            let target = self
                .workflow
                .resolve_transition(&current, &label)
                .map(str::to_string);
            let Some(target) = target else {
                let mut message =
                    format!("no transition for label '{label}' from state '{current}'");
                if let Some(first) = result.first_error() {
                    message.push_str(&format!(" (first error: {first})"));
                }
                ctx.history.push(result);
                return Err((current, Halt::error(message)));
            };
            ctx.history.push(result);

            let target = match self.guard_transition(ctx, &current, target).await {
                Ok(target) => target,
                Err(halt) => return Err((current, halt)),
            };
            debug!(from = %current, to = %target, label = %label, "transition");
            self.emit(WorkflowEvent::Transition {
                from: current.clone(),
                to: target.clone(),
                label,
            });
            current = target;
        }
    }

    /// Honors pause and abort before a state. Returns false when aborted.
    async fn checkpoint(&self) -> bool {
        match self.handle.state() {
            ControlState::Running => true,
            ControlState::Aborted => false,
            ControlState::Paused => {
                info!("run paused");
                self.emit(WorkflowEvent::Paused);
                let resumed = self.handle.wait_while_paused().await;
                if resumed {
                    info!("run resumed");
                    self.emit(WorkflowEvent::Resumed);
                }
                resumed
            }
        }
    }

    async fn execute(
        &self,
        ctx: &mut RunContext,
        name: &str,
        def: &StateDef,
        feedback: &[PendingFeedback],
    ) -> Result<StateResult, Halt> {
        match def.kind {
            StateKind::Initial => Ok(StateResult::new(name, "next")),
            StateKind::FanOut | StateKind::Single => {
                self.execute_agents(ctx, name, def, feedback, false).await
            }
            StateKind::OrchestratorTask => {
                self.execute_agents(ctx, name, def, feedback, true).await
            }
            StateKind::HumanApproval => self.execute_approval(ctx, name).await,
            StateKind::Terminal => Ok(StateResult::new(name, "")),
        }
    }

    async fn execute_agents(
        &self,
        ctx: &mut RunContext,
        name: &str,
        def: &StateDef,
        feedback: &[PendingFeedback],
        with_session: bool,
    ) -> Result<StateResult, Halt> {
        let inputs = self.read_inputs(ctx, name, def);
        let previous = self.previous_outputs(ctx, def);
        let session = with_session.then(|| ctx.run.run_id.clone());
        let state_limit = def
            .timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|limit| !limit.is_zero());

        let mut workers = Vec::new();
        let mut results = Vec::new();
        for agent_name in def.agent_names() {
            let Some(agent) = self.agents.get(agent_name).cloned() else {
                let error = AgentError::NotConfigured(agent_name.to_string());
                results.push(FanOutResult::failed(agent_name, error.to_string(), Duration::ZERO));
                continue;
            };
            let persona = match def.persona_for(agent_name) {
                Some(persona) => {
                    let text = self.personas.compose(persona);
                    if text.is_empty() {
                        warn!(state = %name, persona, "persona resolved empty, continuing");
                    }
                    text
                }
                None => String::new(),
            };
            let prompt = compose_prompt(&PromptParts {
                persona: &persona,
                instructions: def.prompt.as_deref(),
                inputs: &inputs,
                previous: &previous,
                feedback,
            });
            ctx.last_prompt = prompt.clone();
            let limit = state_limit.unwrap_or_else(|| agent.timeout());
            debug!(
                state = %name,
                agent = %agent_name,
                limit_secs = limit.as_secs_f64(),
                "spawning worker"
            );
            workers.push(Worker {
                agent_name: agent_name.to_string(),
                handle: spawn_worker(
                    agent_name.to_string(),
                    agent.clone(),
                    prompt,
                    limit,
                    session.clone(),
                ),
                agent,
            });
        }

        let joined = tokio::select! {
            joined = join_workers(&mut workers) => Some(joined),
            _ = self.handle.aborted() => None,
        };
        let Some(joined) = joined else {
            for worker in &workers {
                worker.agent.kill().await;
                worker.handle.abort();
            }
            return Err(Halt::aborted());
        };
        results.extend(joined);

        let results = results
            .into_iter()
            .map(|result| self.record_result(ctx, name, def, with_session, result))
            .collect();
        let mut state_result = StateResult::new(name, "").with_results(results);
        if state_result.results.values().any(|r| r.is_success()) {
            ctx.previous = Some(name.to_string());
        }

        state_result.transition = if def.is_audit() {
            self.aggregate_audits(ctx, name, &mut state_result).label().to_string()
        } else if def.kind == StateKind::FanOut {
            state_result.fan_out_label().to_string()
        } else if state_result.results.values().all(|r| r.is_success()) {
            "success".to_string()
        } else {
            "failure".to_string()
        };
        Ok(state_result)
    }

    /// Accounting, breaker cost and output persistence for one result.
    fn record_result(
        &self,
        ctx: &mut RunContext,
        state: &str,
        def: &StateDef,
        with_session: bool,
        result: FanOutResult,
    ) -> FanOutResult {
        let agent = result.agent().to_string();
        let window = self
            .agents
            .get(&agent)
            .map(|a| a.context_window())
            .unwrap_or(DEFAULT_CONTEXT_WINDOW);
        ctx.tracker.record(state, &agent, window, result.tokens(), result.cost(), with_session);
        ctx.breaker.add_cost(result.cost());
        ctx.run.add_usage(result.tokens(), result.cost());

        let Some(content) = result.content().map(str::to_string) else {
            warn!(
                state,
                agent = %agent,
                status = ?result.status(),
                error = result.error().unwrap_or_default(),
                "agent failed"
            );
            return result;
        };
        info!(
            state,
            agent = %agent,
            tokens = result.tokens().total(),
            cost = result.cost(),
            "agent succeeded"
        );

        let record = OutputRecord {
            run_id: ctx.run.run_id.clone(),
            state: state.to_string(),
            output_type: def.output_type.clone(),
            agent: agent.clone(),
            content: content.clone(),
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.outputs.save(&record) {
            error!(state, agent = %agent, error = %e, "failed to save output");
        }

        let outputs = ctx.outputs.entry(state.to_string()).or_default();
        outputs.retain(|(a, _)| *a != agent);
        outputs.push((agent.clone(), content.clone()));

        let Some(template) = &def.output else {
            return result;
        };
        let path = render_template(
            template,
            &[
                ("run_id", ctx.run.run_id.as_str()),
                ("state", state),
                ("agent", agent.as_str()),
                ("output_type", def.output_type.as_deref().unwrap_or("output")),
            ],
        );
        match write_output_file(Path::new(&path), &content) {
            Ok(()) => result.with_output_path(path),
            Err(e) => {
                warn!(state, agent = %agent, error = %e, "best-effort output write failed");
                result
            }
        }
    }

    /// Combines audit verdicts and queues retry feedback. Failed auditors
    /// count as fail-closed retries.
    fn aggregate_audits(
        &self,
        ctx: &mut RunContext,
        name: &str,
        result: &mut StateResult,
    ) -> Decision {
        let verdicts = result
            .results
            .values()
            .map(|r| {
                let verdict = match r.content() {
                    Some(content) => parse_audit(content),
                    None => AuditResult::fail_closed(r.error().unwrap_or("no output")),
                };
                (r.agent().to_string(), verdict)
            })
            .collect();
        let Some(aggregate) = AuditAggregate::combine(verdicts) else {
            return Decision::Retry;
        };
        info!(
            state = %name,
            decision = %aggregate.decision,
            score = aggregate.score,
            "audit aggregated"
        );

        ctx.last_audit_score = Some(aggregate.score);
        ctx.last_audits = aggregate.results.clone();
        if aggregate.decision == Decision::Retry {
            match self.workflow.resolve_transition(name, "retry") {
                Some(target) => {
                    let reviewers: Vec<&str> =
                        aggregate.results.iter().map(|(a, _)| a.as_str()).collect();
                    let context = format!(
                        "Reviewed at '{name}' by {} (lowest score {}/10).",
                        reviewers.join(", "),
                        aggregate.score
                    );
                    let feedback = PendingFeedback::auditor(aggregate.feedback.clone(), context);
                    ctx.add_feedback(target, feedback);
                }
                None => warn!(state = %name, "retry verdict but no retry transition"),
            }
        }
        let decision = aggregate.decision;
        result.audit = Some(aggregate);
        decision
    }

    async fn execute_approval(
        &self,
        ctx: &mut RunContext,
        name: &str,
    ) -> Result<StateResult, Halt> {
        let response = self
            .request_approval(ctx, name, ApprovalReason::Review)
            .await?;
        if response.decision == ApprovalDecision::Approved {
            return Ok(StateResult::new(name, "approved"));
        }
        match (response.feedback, self.workflow.resolve_transition(name, "feedback")) {
            (Some(text), Some(target)) => {
                info!(state = %name, to = target, "user feedback queued");
                ctx.add_feedback(target, PendingFeedback::user(text));
            }
            (None, _) => warn!(state = %name, "feedback decision without text"),
            (Some(_), None) => warn!(state = %name, "feedback given but no feedback transition"),
        }
        Ok(StateResult::new(name, "feedback"))
    }

    /// Notifies, then blocks for one decision. Abort and timeout both end the
    /// run as aborted.
    async fn request_approval(
        &self,
        ctx: &RunContext,
        state: &str,
        reason: ApprovalReason,
    ) -> Result<ApprovalResponse, Halt> {
        let request = ApprovalRequest {
            run_id: ctx.run.run_id.clone(),
            state: state.to_string(),
            reason,
            content: self.artifact(ctx),
            prompt: ctx.last_prompt.clone(),
            audits: ctx.last_audits.clone(),
            last_audit_score: ctx.last_audit_score,
        };
        let rx = self.handle.await_approval();
        info!(run_id = %ctx.run.run_id, state, "awaiting approval");
        self.emit(WorkflowEvent::ApprovalRequested {
            state: state.to_string(),
        });
        if let Some(notifier) = &self.notifier {
            if let Err(e) = notifier.notify(&request) {
                warn!(state, error = %e, "approval notifier failed");
            }
        }
        match self.handle.wait_for_approval(rx, self.approval_timeout).await {
            ApprovalWait::Decided(response) => {
                info!(state, decision = %response.decision, "approval received");
                Ok(response)
            }
            ApprovalWait::Aborted => Err(Halt::aborted()),
            // An unanswered approval counts as an abort decision.
            ApprovalWait::TimedOut => Err(Halt::aborted_because(format!(
                "approval timed out after {}s",
                self.approval_timeout.as_secs()
            ))),
        }
    }

    /// Hard limits first, then soft rules with auto-skip, human override
    /// or halt, in that order.
    async fn guard_transition(
        &self,
        ctx: &mut RunContext,
        from: &str,
        to: String,
    ) -> Result<String, Halt> {
        if let Some(event) = ctx.breaker.check_hard_limits(from, &to) {
            error!(from, to = %to, rule = %event.rule, "hard safety limit reached");
            let message = event.message.clone();
            self.emit(WorkflowEvent::CircuitBreak {
                state: from.to_string(),
                event,
            });
            return Err(Halt::error(message));
        }
        let Some(event) = ctx.breaker.check(from, &to) else {
            return Ok(to);
        };
        let message = event.message.clone();
        self.emit(WorkflowEvent::CircuitBreak {
            state: from.to_string(),
            event,
        });

        let forward = self.forward_transition(from);
        if let (Some(score), Some(skip)) = (ctx.last_audit_score, forward) {
            if score >= self.auto_skip_score {
                info!(from, to = skip, score, "quality good enough, skipping past circuit break");
                ctx.breaker.redirect_last(skip);
                self.emit(WorkflowEvent::AutoSkipped {
                    from: from.to_string(),
                    to: skip.to_string(),
                    score,
                });
                return Ok(skip.to_string());
            }
        }

        if self.notifier.is_none() {
            return Err(Halt::error(format!("circuit breaker tripped: {message}")));
        }
        let response = self
            .request_approval(ctx, from, ApprovalReason::CircuitBreak { message })
            .await?;
        match response.decision {
            ApprovalDecision::Feedback => {
                let Some(synthesis) = self.workflow.synthesis_state() else {
                    return Err(Halt::error(
                        "guidance given but the workflow has no synthesis state",
                    ));
                };
                ctx.breaker.reset_counters();
                if let Some(text) = response.feedback {
                    ctx.add_feedback(synthesis, PendingFeedback::user(text));
                }
                info!(from, to = synthesis, "human guidance, breaker reset");
                Ok(synthesis.to_string())
            }
            // Accept as-is.
            _ => Ok(forward.map(str::to_string).unwrap_or(to)),
        }
    }

    fn forward_transition(&self, state: &str) -> Option<&str> {
        FORWARD_LABELS
            .iter()
            .find_map(|label| self.workflow.resolve_transition(state, label))
    }

    fn read_inputs(&self, ctx: &RunContext, state: &str, def: &StateDef) -> Vec<(String, String)> {
        def.inputs
            .iter()
            .filter_map(|template| {
                let path = render_template(
                    template,
                    &[("run_id", ctx.run.run_id.as_str()), ("state", state)],
                );
                match std::fs::read_to_string(&path) {
                    Ok(content) => Some((path, content)),
                    Err(e) => {
                        warn!(state, path = %path, error = %e, "input not readable, skipping");
                        None
                    }
                }
            })
            .collect()
    }

    /// Latest outputs of `context_from`, or of the previous producing state.
    fn previous_outputs(&self, ctx: &RunContext, def: &StateDef) -> Vec<(String, String)> {
        let sources: Vec<&str> = if def.context_from.is_empty() {
            ctx.previous.as_deref().into_iter().collect()
        } else {
            def.context_from.iter().map(String::as_str).collect()
        };
        sources
            .into_iter()
            .filter_map(|state| ctx.outputs.get(state).map(|o| (state, o)))
            .flat_map(|(state, outputs)| {
                outputs
                    .iter()
                    .map(move |(agent, content)| (format!("{state} ({agent})"), content.clone()))
            })
            .collect()
    }

    /// The most recent artifact, for approval requests.
    fn artifact(&self, ctx: &RunContext) -> String {
        let Some(outputs) = ctx.previous.as_deref().and_then(|s| ctx.outputs.get(s)) else {
            return String::new();
        };
        match outputs.as_slice() {
            [(_, only)] => only.clone(),
            many => many
                .iter()
                .map(|(agent, content)| format!("### {agent}\n{content}"))
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }

    fn clear_sessions(&self, run_id: &str) {
        let agents = self
            .workflow
            .states
            .values()
            .filter(|def| def.kind == StateKind::OrchestratorTask)
            .flat_map(|def| def.agent_names());
        for name in agents {
            let Some(agent) = self.agents.get(name) else {
                continue;
            };
            match agent.clear_session(run_id) {
                Ok(()) => debug!(agent = name, run_id, "session cleared"),
                Err(e) => warn!(agent = name, run_id, error = %e, "failed to clear session"),
            }
        }
    }

    fn finish(&self, mut ctx: RunContext, step: Step) -> RunOutcome {
        let (status, final_state, failed_state, error, aborted) = match step {
            Ok((terminal, TerminalOutcome::Complete)) => {
                (RunStatus::Complete, Some(terminal), None, None, false)
            }
            Ok((terminal, TerminalOutcome::Failed)) => {
                let last = ctx.history.last();
                let error = last
                    .and_then(|r| r.first_error())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("run ended in failure state '{terminal}'"));
                let failed_state = last.map(|r| r.state.clone());
                (RunStatus::Failed, Some(terminal), failed_state, Some(error), false)
            }
            Err((state, halt)) => {
                let state = (!state.is_empty()).then_some(state);
                (RunStatus::Halted, state.clone(), state, Some(halt.error), halt.aborted)
            }
        };

        if aborted {
            self.emit(WorkflowEvent::Aborted {
                state: failed_state.clone(),
            });
        }
        ctx.run.finish(status, final_state.as_deref());
        let summary = ctx.tracker.summary();
        if status != RunStatus::Halted {
            self.clear_sessions(&ctx.run.run_id);
        }

        match &error {
            Some(e) => warn!(run_id = %ctx.run.run_id, status = %status, error = %e, "run ended"),
            None => info!(
                run_id = %ctx.run.run_id,
                status = %status,
                cost = summary.cost,
                "run complete"
            ),
        }
        self.emit(WorkflowEvent::RunFinished {
            status,
            final_state: final_state.clone(),
            error: error.clone(),
            summary: summary.clone(),
        });

        RunOutcome {
            run_id: ctx.run.run_id,
            status,
            final_state,
            failed_state,
            error,
            aborted,
            summary,
            history: ctx.history,
        }
    }

    fn emit(&self, event: WorkflowEvent) {
        if let Err(e) = self.events.emit(&event) {
            warn!(error = %e, "event sink failed");
        }
    }
}

/// Slack past an agent's grace period for a killed call to wind down.
const KILL_SETTLE_MARGIN: Duration = Duration::from_millis(500);

/// Runs one agent call on its own task. A call that outlives `limit` gets
/// the agent's kill hook, then is polled until it settles or the agent's
/// grace period plus a margin runs out.
fn spawn_worker(
    name: String,
    agent: Arc<dyn Agent>,
    prompt: String,
    limit: Duration,
    session: Option<String>,
) -> JoinHandle<FanOutResult> {
    tokio::spawn(async move {
        let call = async {
            match &session {
                Some(id) => agent.invoke_with_session(id, &prompt).await,
                None => agent.invoke(&prompt).await,
            }
        };
        tokio::pin!(call);
        tokio::select! {
            response = &mut call => {
                let cost = response
                    .cost
                    .unwrap_or_else(|| agent.calculate_cost(response.tokens));
                FanOutResult::from_response(name, response, cost)
            }
            _ = tokio::time::sleep(limit) => {
                warn!(agent = %name, limit_secs = limit.as_secs_f64(), "agent timed out, killing");
                agent.kill().await;
                // Keep polling the call so the agent can run its own shutdown.
                let settle = agent.grace_period() + KILL_SETTLE_MARGIN;
                if tokio::time::timeout(settle, &mut call).await.is_err() {
                    debug!(agent = %name, "killed call did not settle in time");
                }
                FanOutResult::timeout(name, limit)
            }
        }
    })
}

async fn join_workers(workers: &mut [Worker]) -> Vec<FanOutResult> {
    let mut results = Vec::with_capacity(workers.len());
    for worker in workers.iter_mut() {
        let result = match (&mut worker.handle).await {
            Ok(result) => result,
            Err(e) => FanOutResult::failed(
                worker.agent_name.as_str(),
                format!("worker failed: {e}"),
                Duration::ZERO,
            ),
        };
        results.push(result);
    }
    results
}

#[cfg(test)]
mod tests;
