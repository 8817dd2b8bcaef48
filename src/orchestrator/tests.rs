use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use super::*;
use crate::agents::{AgentResponse, Pricing, TokenUsage};
use crate::circuit_breaker::BreakRule;
use crate::state_machine::FanOutStatus;

/// Scripted agent: pops replies in order, then repeats `fallback`.
/// A reply of `"!fail"` produces a failed response.
struct MockAgent {
    name: String,
    replies: Mutex<VecDeque<String>>,
    fallback: String,
    delay: Duration,
    prompts: Mutex<Vec<String>>,
    sessions: Mutex<Vec<String>>,
    kills: AtomicUsize,
    cleared: AtomicUsize,
}

impl MockAgent {
    fn new(name: &str, fallback: &str) -> Arc<Self> {
        Self::build(name, fallback, Vec::new(), Duration::ZERO)
    }

    fn scripted(name: &str, replies: Vec<String>, fallback: &str) -> Arc<Self> {
        Self::build(name, fallback, replies, Duration::ZERO)
    }

    fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Self::build(name, "late", Vec::new(), delay)
    }

    fn build(name: &str, fallback: &str, replies: Vec<String>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            replies: Mutex::new(replies.into()),
            fallback: fallback.to_string(),
            delay,
            prompts: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
            kills: AtomicUsize::new(0),
            cleared: AtomicUsize::new(0),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn pricing(&self) -> Pricing {
        Pricing {
            input_per_1k: 1.0,
            output_per_1k: 2.0,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn invoke(&self, prompt: &str) -> AgentResponse {
        self.prompts.lock().push(prompt.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if reply == "!fail" {
            return AgentResponse::failed(format!("{} exploded", self.name), Duration::ZERO);
        }
        AgentResponse::ok(reply, TokenUsage::new(100, 50), Duration::from_millis(1))
    }

    async fn invoke_with_session(&self, session_id: &str, prompt: &str) -> AgentResponse {
        self.sessions.lock().push(session_id.to_string());
        self.invoke(prompt).await.with_session(session_id)
    }

    async fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }

    fn clear_session(&self, _session_id: &str) -> Result<(), crate::error::SessionError> {
        self.cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Answers each approval request with the next queued response.
struct ScriptedApprover {
    handle: RunHandle,
    responses: Mutex<VecDeque<(ApprovalDecision, Option<String>)>>,
    requests: Mutex<Vec<ApprovalRequest>>,
}

impl ScriptedApprover {
    fn new(handle: RunHandle, responses: Vec<(ApprovalDecision, Option<String>)>) -> Arc<Self> {
        Arc::new(Self {
            handle,
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }
}

impl ApprovalNotifier for ScriptedApprover {
    fn notify(&self, request: &ApprovalRequest) -> anyhow::Result<()> {
        self.requests.lock().push(request.clone());
        if let Some((decision, feedback)) = self.responses.lock().pop_front() {
            self.handle.submit_approval(decision, feedback)?;
        }
        Ok(())
    }
}

fn verdict(score: u8, decision: &str) -> String {
    format!(
        "```json\n{{\"score\": {score}, \"decision\": \"{decision}\", \"feedback\": \"verdict {score}\"}}\n```"
    )
}

fn agents(list: &[&Arc<MockAgent>]) -> HashMap<String, Arc<dyn Agent>> {
    list.iter()
        .map(|a| (a.name.clone(), Arc::clone(*a) as Arc<dyn Agent>))
        .collect()
}

fn workflow(toml: &str) -> WorkflowDefinition {
    WorkflowDefinition::from_toml_str(toml).unwrap()
}

const STORY: &str = r#"
name = "story"

[default_transitions]
failure = "failed"
halt = "failed"

[agents.writer_a]
[agents.writer_b]
[agents.critic_a]
[agents.critic_b]
[agents.synth]

[states.start]
type = "initial"
next = "draft"

[states.draft]
type = "fan_out"
agents = ["writer_a", "writer_b"]
persona = "novelist"
prompt = "Write chapter one."
transitions = { all_success = "audit", partial_success = "audit" }

[states.audit]
type = "fan_out"
agents = ["critic_a", "critic_b"]
output_type = "audit"
transitions = { proceed = "synthesis", retry = "synthesis" }

[states.synthesis]
type = "orchestrator_task"
agent = "synth"
context_from = ["draft"]
transitions = { success = "final_audit" }

[states.final_audit]
type = "single"
agent = "critic_a"
output_type = "final_audit"
transitions = { proceed = "done", retry = "synthesis" }

[states.done]
type = "terminal"

[states.failed]
type = "terminal"
outcome = "failed"
"#;

struct Story {
    writer_a: Arc<MockAgent>,
    writer_b: Arc<MockAgent>,
    critic_a: Arc<MockAgent>,
    critic_b: Arc<MockAgent>,
    synth: Arc<MockAgent>,
}

impl Story {
    fn new(critic_a: Vec<String>, critic_b: Vec<String>) -> Self {
        Self {
            writer_a: MockAgent::new("writer_a", "Draft A"),
            writer_b: MockAgent::new("writer_b", "Draft B"),
            critic_a: MockAgent::scripted("critic_a", critic_a, &verdict(9, "proceed")),
            critic_b: MockAgent::scripted("critic_b", critic_b, &verdict(9, "proceed")),
            synth: MockAgent::new("synth", "Merged chapter"),
        }
    }

    fn orchestrator(&self, toml: &str) -> Orchestrator {
        Orchestrator::new(
            workflow(toml),
            agents(&[
                &self.writer_a,
                &self.writer_b,
                &self.critic_a,
                &self.critic_b,
                &self.synth,
            ]),
        )
    }
}

fn labels(outcome: &RunOutcome) -> Vec<(&str, &str)> {
    outcome
        .history
        .iter()
        .map(|r| (r.state.as_str(), r.transition.as_str()))
        .collect()
}

#[tokio::test]
async fn run_requires_initialize() {
    let story = Story::new(Vec::new(), Vec::new());
    let mut orch = story.orchestrator(STORY);
    assert_eq!(
        orch.run(None).await.unwrap_err(),
        OrchestratorError::NotInitialized
    );
}

#[tokio::test]
async fn happy_path_completes_and_accounts() {
    let story = Story::new(Vec::new(), Vec::new());
    let store = Arc::new(MemoryOutputStore::new());
    let sink = Arc::new(MemorySink::new());
    let mut orch = story
        .orchestrator(STORY)
        .with_personas(Arc::new(StaticPersonas::new().with("novelist", "You are a novelist.")))
        .with_output_store(store.clone())
        .with_event_sink(sink.clone());
    orch.initialize("run-1");
    let outcome = orch.run(None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Complete, "{:?}", outcome.error);
    assert_eq!(outcome.final_state.as_deref(), Some("done"));
    assert!(!outcome.aborted);
    assert_eq!(
        labels(&outcome),
        vec![
            ("start", "next"),
            ("draft", "all_success"),
            ("audit", "proceed"),
            ("synthesis", "success"),
            ("final_audit", "proceed"),
        ]
    );

    // Two drafts, two audits, one synthesis, one final audit.
    assert_eq!(store.records().len(), 6);
    assert_eq!(outcome.summary.invocations, 6);
    assert_eq!(outcome.summary.tokens, TokenUsage::new(600, 300));
    assert!((outcome.summary.cost - 6.0 * 0.2).abs() < 1e-9);

    let draft_prompt = &story.writer_a.prompts()[0];
    assert!(draft_prompt.starts_with("You are a novelist.\n\nWrite chapter one."));
    let synth_prompt = &story.synth.prompts()[0];
    assert!(synth_prompt.contains("## draft (writer_a)\n\nDraft A"));
    assert!(synth_prompt.contains("## draft (writer_b)\n\nDraft B"));

    assert_eq!(*story.synth.sessions.lock(), vec!["run-1".to_string()]);
    assert_eq!(story.synth.cleared.load(Ordering::SeqCst), 1);

    let events = sink.events();
    assert!(matches!(events.first(), Some(WorkflowEvent::RunStarted { .. })));
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::RunFinished {
            status: RunStatus::Complete,
            ..
        })
    ));
}

#[tokio::test]
async fn unresolved_label_halts_with_first_error() {
    let story = Story::new(Vec::new(), Vec::new());
    let failing = MockAgent::new("writer_a", "!fail");
    let mut agents = agents(&[&failing, &story.critic_a, &story.critic_b, &story.synth]);
    agents.insert("writer_b".into(), failing.clone());

    let mut orch = Orchestrator::new(workflow(STORY), agents);
    orch.initialize("run-2");
    let outcome = orch.run(None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Halted);
    assert_eq!(outcome.failed_state.as_deref(), Some("draft"));
    let error = outcome.error.unwrap();
    assert!(error.contains("'all_failure'"), "{error}");
    assert!(error.contains("writer_a exploded"), "{error}");
    assert!(!outcome.aborted);
    assert_eq!(story.synth.cleared.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn audit_retry_feeds_both_sections_to_retry_target() {
    let story = Story::new(vec![verdict(9, "proceed")], vec![verdict(4, "retry")]);
    let mut orch = story.orchestrator(STORY);
    orch.initialize("run-3");
    let outcome = orch.run(None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Complete, "{:?}", outcome.error);
    let audit = outcome.history[2].audit.as_ref().unwrap();
    assert_eq!(audit.decision, Decision::Retry);
    assert_eq!(audit.score, 4);
    assert_eq!(outcome.history[2].transition, "retry");

    let synth_prompt = &story.synth.prompts()[0];
    let tag_at = synth_prompt.find(AUDITOR_FEEDBACK_TAG).unwrap();
    let context_at = synth_prompt.find("Reviewed at 'audit'").unwrap();
    assert!(context_at < tag_at);
    assert!(synth_prompt.contains("### critic_a"));
    assert!(synth_prompt.contains("### critic_b"));
    assert!(synth_prompt.contains("lowest score 4/10"));
}

#[tokio::test]
async fn malformed_audit_fails_closed() {
    let story = Story::new(vec!["looks great!".into()], Vec::new());
    let mut orch = story.orchestrator(STORY);
    orch.initialize("run-4");
    let outcome = orch.run(None).await.unwrap();

    let audit = outcome.history[2].audit.as_ref().unwrap();
    assert_eq!(audit.decision, Decision::Retry);
    assert_eq!(audit.score, 1);
}

#[tokio::test]
async fn fan_out_timeout_is_partial_success_and_kills_once() {
    let toml = STORY.replace(
        "agents = [\"writer_a\", \"writer_b\"]",
        "agents = [\"writer_a\", \"writer_b\"]\ntimeout_secs = 0.1",
    );
    let mut story = Story::new(Vec::new(), Vec::new());
    story.writer_b = MockAgent::slow("writer_b", Duration::from_secs(10));
    let mut orch = story.orchestrator(&toml);
    orch.initialize("run-5");

    let outcome = tokio::time::timeout(Duration::from_secs(5), orch.run(None))
        .await
        .unwrap()
        .unwrap();

    let draft = &outcome.history[1];
    assert_eq!(draft.transition, "partial_success");
    assert_eq!(draft.results["writer_b"].status(), FanOutStatus::Timeout);
    assert!(draft.results["writer_a"].is_success());
    assert_eq!(story.writer_b.kills.load(Ordering::SeqCst), 1);
    assert_eq!(story.writer_a.kills.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.status, RunStatus::Complete);
}

#[cfg(unix)]
#[tokio::test]
async fn fan_out_timeout_lets_process_child_handle_sigterm() {
    use crate::agents::{ProcessAgent, ProcessAgentConfig, RetryPolicy};

    let dir = TempDir::new().unwrap();
    let mark = dir.path().join("term");
    let script = format!(
        "trap 'echo term > {}; kill $!; exit 0' TERM; sleep 30 & wait",
        mark.display()
    );
    let process = ProcessAgent::new(ProcessAgentConfig {
        name: "writer_b".into(),
        command: "sh".into(),
        args: vec!["-c".into(), script],
        model: None,
        model_flag: None,
        timeout: Duration::from_secs(30),
        grace_period: Duration::from_secs(2),
        pricing: Pricing {
            input_per_1k: 1.0,
            output_per_1k: 2.0,
        },
        context_window: 1000,
        retry: RetryPolicy {
            max_retries: 0,
            base_delay_ms: 1,
        },
        session_pattern: None,
        resume_flag: None,
        sessions_dir: dir.path().to_path_buf(),
        history_max_messages: 20,
    })
    .unwrap();

    let toml = STORY.replace(
        "agents = [\"writer_a\", \"writer_b\"]",
        "agents = [\"writer_a\", \"writer_b\"]\ntimeout_secs = 0.3",
    );
    let story = Story::new(Vec::new(), Vec::new());
    let mut roster = agents(&[
        &story.writer_a,
        &story.critic_a,
        &story.critic_b,
        &story.synth,
    ]);
    roster.insert("writer_b".into(), Arc::new(process));
    let mut orch = Orchestrator::new(workflow(&toml), roster);
    orch.initialize("run-term");

    let outcome = tokio::time::timeout(Duration::from_secs(10), orch.run(None))
        .await
        .unwrap()
        .unwrap();

    let draft = &outcome.history[1];
    assert_eq!(draft.transition, "partial_success");
    assert_eq!(draft.results["writer_b"].status(), FanOutStatus::Timeout);
    assert!(mark.exists(), "child was killed without SIGTERM");
}

const APPROVAL: &str = r#"
name = "approval"

[agents.synth]

[states.start]
type = "initial"
next = "synthesis"

[states.synthesis]
type = "orchestrator_task"
agent = "synth"
transitions = { success = "review" }

[states.review]
type = "human_approval"
transitions = { approved = "done", feedback = "synthesis" }

[states.done]
type = "terminal"
"#;

#[tokio::test]
async fn approval_feedback_then_approve() {
    let synth = MockAgent::scripted("synth", vec!["First cut".into()], "Second cut");
    let mut orch = Orchestrator::new(workflow(APPROVAL), agents(&[&synth]));
    let approver = ScriptedApprover::new(
        orch.handle(),
        vec![
            (ApprovalDecision::Feedback, Some("Give the villain a motive.".into())),
            (ApprovalDecision::Approved, None),
        ],
    );
    orch = orch.with_approval_notifier(approver.clone());
    orch.initialize("run-6");
    let outcome = orch.run(None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Complete, "{:?}", outcome.error);
    let review_labels: Vec<_> = labels(&outcome)
        .into_iter()
        .filter(|(s, _)| *s == "review")
        .map(|(_, l)| l)
        .collect();
    assert_eq!(review_labels, vec!["feedback", "approved"]);

    let requests = approver.requests.lock();
    assert_eq!(requests[0].content, "First cut");
    assert_eq!(requests[0].reason, ApprovalReason::Review);
    assert_eq!(requests[1].content, "Second cut");

    let second = &synth.prompts()[1];
    assert!(second.contains(USER_FEEDBACK_TAG));
    assert!(second.contains("Give the villain a motive."));
}

#[tokio::test]
async fn approval_submitted_from_another_task() {
    let synth = MockAgent::new("synth", "Only cut");
    let mut orch = Orchestrator::new(workflow(APPROVAL), agents(&[&synth]));
    let handle = orch.handle();
    orch.initialize("run-7");

    let approve = async {
        while !handle.approval_pending() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.submit_approval(ApprovalDecision::Approved, None).unwrap();
    };
    let (outcome, ()) = tokio::join!(orch.run(None), approve);
    assert_eq!(outcome.unwrap().status, RunStatus::Complete);
}

#[tokio::test]
async fn abort_during_approval_returns_promptly() {
    let synth = MockAgent::new("synth", "Only cut");
    let mut orch = Orchestrator::new(workflow(APPROVAL), agents(&[&synth]));
    let handle = orch.handle();
    orch.initialize("run-8");

    let abort = async {
        while !handle.approval_pending() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.abort();
    };
    let (outcome, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(orch.run(None), abort)
    })
    .await
    .unwrap();
    let outcome = outcome.unwrap();

    assert_eq!(outcome.status, RunStatus::Halted);
    assert!(outcome.aborted);
    assert_eq!(outcome.error.as_deref(), Some("aborted by user"));
    assert_eq!(outcome.failed_state.as_deref(), Some("review"));
}

#[tokio::test]
async fn abort_during_pause_returns_promptly() {
    let synth = MockAgent::new("synth", "Only cut");
    let mut orch = Orchestrator::new(workflow(APPROVAL), agents(&[&synth]));
    let handle = orch.handle();
    orch.initialize("run-9");
    handle.pause();

    let abort = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();
    };
    let (outcome, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(orch.run(None), abort)
    })
    .await
    .unwrap();
    let outcome = outcome.unwrap();

    assert_eq!(outcome.status, RunStatus::Halted);
    assert!(outcome.aborted);
    assert_eq!(outcome.error.as_deref(), Some("aborted by user"));
    assert!(synth.prompts().is_empty());
}

#[tokio::test]
async fn pause_then_resume_continues() {
    let synth = MockAgent::new("synth", "Only cut");
    let sink = Arc::new(MemorySink::new());
    let mut orch = Orchestrator::new(workflow(APPROVAL), agents(&[&synth]))
        .with_event_sink(sink.clone());
    let approver = ScriptedApprover::new(orch.handle(), vec![(ApprovalDecision::Approved, None)]);
    orch = orch.with_approval_notifier(approver);
    let handle = orch.handle();
    orch.initialize("run-10");
    handle.pause();

    let resume = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.resume();
    };
    let (outcome, ()) = tokio::join!(orch.run(None), resume);
    assert_eq!(outcome.unwrap().status, RunStatus::Complete);

    let events = sink.events();
    assert!(events.contains(&WorkflowEvent::Paused));
    assert!(events.contains(&WorkflowEvent::Resumed));
}

#[tokio::test]
async fn approval_timeout_resolves_to_abort() {
    let synth = MockAgent::new("synth", "Only cut");
    let mut orch = Orchestrator::new(workflow(APPROVAL), agents(&[&synth]))
        .with_approval_timeout(Duration::from_millis(20));
    orch.initialize("run-11");
    let outcome = orch.run(None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Halted);
    assert!(outcome.aborted);
    assert_eq!(outcome.failed_state.as_deref(), Some("review"));
    assert!(outcome.error.unwrap().contains("timed out"));
}

const LOOP: &str = r#"
name = "loop"

[circuit_breaker]
max_state_visits = 3

[agents.synth]
[agents.critic]

[states.start]
type = "initial"
next = "synthesis"

[states.synthesis]
type = "orchestrator_task"
agent = "synth"
transitions = { success = "audit" }

[states.audit]
type = "single"
agent = "critic"
output_type = "audit"
transitions = { proceed = "done", retry = "synthesis" }

[states.done]
type = "terminal"
"#;

fn looping(score: u8) -> (Arc<MockAgent>, Arc<MockAgent>, HashMap<String, Arc<dyn Agent>>) {
    let synth = MockAgent::new("synth", "Chapter");
    let critic = MockAgent::new("critic", &verdict(score, "retry"));
    let map = agents(&[&synth, &critic]);
    (synth, critic, map)
}

#[tokio::test]
async fn soft_break_auto_skips_when_quality_is_good_enough() {
    let (_, _, agents) = looping(8);
    let sink = Arc::new(MemorySink::new());
    let mut orch = Orchestrator::new(workflow(LOOP), agents).with_event_sink(sink.clone());
    orch.initialize("run-12");
    let outcome = orch.run(None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Complete, "{:?}", outcome.error);
    let events = sink.events();
    assert!(events.iter().any(|e| matches!(
        e,
        WorkflowEvent::CircuitBreak { event, .. } if event.rule == BreakRule::StateVisitLimit && !event.hard
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        WorkflowEvent::AutoSkipped { to, score: 8, .. } if to == "done"
    )));
}

#[tokio::test]
async fn auto_skip_records_the_transition_taken() {
    let (_, _, agents) = looping(8);
    let orch = Orchestrator::new(workflow(LOOP), agents);
    let mut ctx = RunContext::new("run-skip".into(), &orch.workflow);
    ctx.last_audit_score = Some(8);

    for _ in 0..2 {
        let next = orch
            .guard_transition(&mut ctx, "audit", "synthesis".into())
            .await
            .unwrap();
        assert_eq!(next, "synthesis");
    }
    let next = orch
        .guard_transition(&mut ctx, "audit", "synthesis".into())
        .await
        .unwrap();

    assert_eq!(next, "done");
    assert_eq!(ctx.breaker.visit_count("synthesis"), 2);
    assert_eq!(ctx.breaker.visit_count("done"), 1);
    let snap = ctx.breaker.snapshot();
    assert_eq!(
        snap.history.last(),
        Some(&("audit".to_string(), "done".to_string()))
    );
}

#[tokio::test]
async fn auto_skip_threshold_is_configurable() {
    let (_, _, agents) = looping(8);
    let mut orch = Orchestrator::new(workflow(LOOP), agents).with_auto_skip_score(9);
    orch.initialize("run-13");
    let outcome = orch.run(None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Halted);
    assert!(outcome.error.unwrap().starts_with("circuit breaker tripped"));
}

#[tokio::test]
async fn human_guidance_resets_breaker_and_loops_to_synthesis() {
    let (synth, _, agents) = looping(3);
    let mut orch = Orchestrator::new(workflow(LOOP), agents);
    let approver = ScriptedApprover::new(
        orch.handle(),
        vec![
            (ApprovalDecision::Feedback, Some("Try the heist from the guard's view.".into())),
            (ApprovalDecision::Abort, None),
        ],
    );
    orch = orch.with_approval_notifier(approver.clone());
    orch.initialize("run-14");
    let outcome = orch.run(None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Halted);
    assert!(outcome.aborted);

    let requests = approver.requests.lock();
    assert_eq!(requests.len(), 2);
    assert!(matches!(requests[0].reason, ApprovalReason::CircuitBreak { .. }));
    assert_eq!(requests[0].last_audit_score, Some(3));

    // Two synthesis runs before the visit limit trips, two more after the
    // reset before the cycle rule trips.
    let prompts = synth.prompts();
    assert_eq!(prompts.len(), 4);
    assert!(prompts[2].contains(USER_FEEDBACK_TAG));
    assert!(prompts[2].contains("guard's view"));
}

#[tokio::test]
async fn hard_limit_is_never_skipped() {
    let toml = r#"
        name = "chain"

        [circuit_breaker]
        max_transitions = 2
        detect_cycles = false

        [safety_limits]
        max_transitions = 3

        [agents.critic]

        [states.start]
        type = "initial"
        next = "a"

        [states.a]
        type = "single"
        agent = "critic"
        output_type = "review"
        transitions = { proceed = "b" }

        [states.b]
        type = "single"
        agent = "critic"
        output_type = "review"
        transitions = { proceed = "c" }

        [states.c]
        type = "single"
        agent = "critic"
        output_type = "review"
        transitions = { proceed = "d" }

        [states.d]
        type = "single"
        agent = "critic"
        output_type = "review"
        transitions = { proceed = "done" }

        [states.done]
        type = "terminal"
    "#;
    let critic = MockAgent::new("critic", &verdict(10, "proceed"));
    let sink = Arc::new(MemorySink::new());
    let mut orch =
        Orchestrator::new(workflow(toml), agents(&[&critic])).with_event_sink(sink.clone());
    orch.initialize("run-15");
    let outcome = orch.run(None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Halted);
    assert_eq!(outcome.failed_state.as_deref(), Some("c"));
    assert!(outcome.error.unwrap().starts_with("hard limit"));
    let events = sink.events();
    assert!(events.iter().any(|e| matches!(e, WorkflowEvent::AutoSkipped { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        WorkflowEvent::CircuitBreak { event, .. } if event.hard && event.rule == BreakRule::TransitionLimit
    )));
}

#[tokio::test]
async fn terminal_failure_state_reports_failed() {
    let story = Story::new(vec![verdict(2, "halt")], Vec::new());
    let mut orch = story.orchestrator(STORY);
    orch.initialize("run-16");
    let outcome = orch.run(None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.final_state.as_deref(), Some("failed"));
    assert_eq!(outcome.failed_state.as_deref(), Some("audit"));
}

#[tokio::test]
async fn unknown_start_state_halts() {
    let story = Story::new(Vec::new(), Vec::new());
    let mut orch = story.orchestrator(STORY);
    orch.initialize("run-17");
    let outcome = orch.run(Some("nowhere")).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Halted);
    assert!(outcome.error.unwrap().contains("unknown state 'nowhere'"));
}

#[tokio::test]
async fn outputs_are_written_to_path_template() {
    let dir = TempDir::new().unwrap();
    let template = dir.path().join("{run_id}/{state}-{agent}.md");
    let toml = STORY.replace(
        "prompt = \"Write chapter one.\"",
        &format!(
            "prompt = \"Write chapter one.\"\noutput = {:?}",
            template.to_string_lossy()
        ),
    );
    let story = Story::new(Vec::new(), Vec::new());
    let mut orch = story.orchestrator(&toml);
    orch.initialize("run-18");
    let outcome = orch.run(None).await.unwrap();

    let written = dir.path().join("run-18/draft-writer_b.md");
    assert_eq!(std::fs::read_to_string(&written).unwrap(), "Draft B");
    assert_eq!(
        outcome.history[1].results["writer_b"].output_path(),
        Some(&*written.to_string_lossy())
    );
}
