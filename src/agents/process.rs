//! Process-invoked agents: one child process per call.
//!
//! The prompt is written to the child's stdin and its stdout is the response.
//! Every in-flight call registers a [`CancellationToken`] so [`Agent::kill`]
//! can reach the child from another task; a cancelled or timed-out child gets
//! SIGTERM, then SIGKILL once the grace period runs out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Agent, AgentResponse, Attempt, Pricing, RetryPolicy, TokenUsage, is_rate_limited,
    with_rate_limit_retry,
};
use crate::error::AgentError;
use crate::session::{
    ChatMessage, FileHistoryStore, NativeSessionStore, Role, SessionContext, SessionContinuity,
};

#[derive(Debug, Clone)]
pub struct ProcessAgentConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    /// Flag that precedes the model id, e.g. `--model`.
    pub model_flag: Option<String>,
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    pub pricing: Pricing,
    pub context_window: u64,
    pub retry: RetryPolicy,
    /// Pattern with one capture group that pulls the provider's resume token
    /// out of stdout. Together with `resume_flag` this selects native sessions.
    pub session_pattern: Option<Regex>,
    pub resume_flag: Option<String>,
    pub sessions_dir: PathBuf,
    pub history_max_messages: usize,
}

enum Continuity {
    Native {
        store: NativeSessionStore,
        pattern: Regex,
        resume_flag: String,
    },
    History(FileHistoryStore),
}

pub struct ProcessAgent {
    config: ProcessAgentConfig,
    continuity: Continuity,
    in_flight: Mutex<HashMap<u64, CancellationToken>>,
    next_call: AtomicU64,
}

enum Exit {
    Finished(ExitStatus),
    Cancelled,
    TimedOut,
}

static INPUT_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""?input_tokens"?\s*[:=]\s*(\d+)"#).expect("valid usage pattern")
});
static OUTPUT_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""?output_tokens"?\s*[:=]\s*(\d+)"#).expect("valid usage pattern")
});

impl ProcessAgent {
    pub fn new(config: ProcessAgentConfig) -> Result<Self, AgentError> {
        if config.command.trim().is_empty() {
            return Err(AgentError::InvalidConfig {
                name: config.name.clone(),
                reason: "process agents need a command".into(),
            });
        }
        let continuity = match (&config.session_pattern, &config.resume_flag) {
            (Some(pattern), Some(flag)) => {
                if pattern.captures_len() < 2 {
                    return Err(AgentError::InvalidConfig {
                        name: config.name.clone(),
                        reason: "session_pattern needs a capture group".into(),
                    });
                }
                Continuity::Native {
                    store: NativeSessionStore::new(&config.sessions_dir, &config.name),
                    pattern: pattern.clone(),
                    resume_flag: flag.clone(),
                }
            }
            _ => Continuity::History(FileHistoryStore::new(
                &config.sessions_dir,
                &config.name,
                config.history_max_messages,
            )),
        };
        Ok(Self {
            config,
            continuity,
            in_flight: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(0),
        })
    }

    fn base_args(&self) -> Vec<String> {
        let mut args = self.config.args.clone();
        if let (Some(flag), Some(model)) = (&self.config.model_flag, &self.config.model) {
            args.push(flag.clone());
            args.push(model.clone());
        }
        args
    }

    fn usage_from_output(&self, prompt: &str, stdout: &str) -> TokenUsage {
        let parse = |re: &Regex| {
            re.captures(stdout)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<u64>().ok())
        };
        match (parse(&INPUT_TOKENS), parse(&OUTPUT_TOKENS)) {
            (Some(input), Some(output)) => TokenUsage::new(input, output),
            _ => self.extract_tokens(prompt, stdout),
        }
    }

    /// Runs the command with retries on rate-limit output.
    async fn call(&self, args: &[String], prompt: &str) -> AgentResponse {
        with_rate_limit_retry(&self.config.name, self.config.retry, move || {
            self.run_once(args, prompt)
        })
        .await
    }

    async fn run_once(&self, args: &[String], prompt: &str) -> Attempt {
        let started = Instant::now();
        let mut child = match Command::new(&self.config.command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(source) => {
                let err = AgentError::Spawn {
                    command: self.config.command.clone(),
                    source,
                };
                return Attempt::Done(AgentResponse::failed(err.to_string(), started.elapsed()));
            }
        };

        // Feed stdin and drain both pipes concurrently so a chatty child
        // never blocks on a full pipe.
        if let Some(mut stdin) = child.stdin.take() {
            let input = prompt.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!(error = %e, "child closed stdin early");
                }
            });
        }
        let stdout_task = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = out.read_to_end(&mut buf).await;
                buf
            })
        });
        let stderr_task = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = err.read_to_end(&mut buf).await;
                buf
            })
        });

        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let registration = InFlight::register(&self.in_flight, call_id, token.clone());

        let exit = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Exit::Finished(status),
                Err(e) => {
                    return Attempt::Done(AgentResponse::failed(
                        format!("failed to wait for '{}': {e}", self.config.command),
                        started.elapsed(),
                    ));
                }
            },
            _ = token.cancelled() => Exit::Cancelled,
            _ = sleep(self.config.timeout) => Exit::TimedOut,
        };
        drop(registration);

        let status = match exit {
            Exit::Finished(status) => status,
            Exit::Cancelled => {
                terminate(&mut child, self.config.grace_period).await;
                return Attempt::Done(AgentResponse::failed(
                    format!("agent '{}' was killed", self.config.name),
                    started.elapsed(),
                ));
            }
            Exit::TimedOut => {
                warn!(
                    agent = %self.config.name,
                    timeout_secs = self.config.timeout.as_secs_f64(),
                    "process timed out"
                );
                terminate(&mut child, self.config.grace_period).await;
                return Attempt::Done(AgentResponse::failed(
                    format!(
                        "agent '{}' timed out after {:.1}s",
                        self.config.name,
                        self.config.timeout.as_secs_f64()
                    ),
                    started.elapsed(),
                ));
            }
        };

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;
        let duration = started.elapsed();
        let content = stdout.trim().to_string();

        if !status.success() || content.is_empty() {
            let error = if stderr.trim().is_empty() {
                format!("'{}' exited with {status} and no output", self.config.command)
            } else {
                format!("'{}' exited with {status}: {}", self.config.command, stderr.trim())
            };
            let response = AgentResponse::failed(error, duration);
            if is_rate_limited(&stderr) || is_rate_limited(&stdout) {
                return Attempt::RateLimited {
                    response,
                    retry_after_ms: None,
                };
            }
            return Attempt::Done(response);
        }

        let tokens = self.usage_from_output(prompt, &stdout);
        let cost = self.calculate_cost(tokens);
        Attempt::Done(AgentResponse::ok(content, tokens, duration).with_cost(cost))
    }

    fn record_exchange(&self, session_id: &str, prompt: &str, response: &AgentResponse) {
        let Some(content) = &response.content else {
            return;
        };
        let store: &dyn SessionContinuity = match &self.continuity {
            Continuity::Native { store, .. } => store,
            Continuity::History(store) => store,
        };
        let user = ChatMessage::new(Role::User, prompt).with_tokens(response.tokens.input);
        let assistant =
            ChatMessage::new(Role::Assistant, content.as_str()).with_tokens(response.tokens.output);
        for message in [user, assistant] {
            if let Err(e) = store.append(session_id, message) {
                warn!(
                    agent = %self.config.name,
                    session_id,
                    error = %e,
                    "failed to persist session"
                );
            }
        }
    }
}

/// Keeps a call's token registered for [`Agent::kill`] until dropped, even
/// when the owning future is dropped mid-call.
struct InFlight<'a> {
    calls: &'a Mutex<HashMap<u64, CancellationToken>>,
    id: u64,
}

impl<'a> InFlight<'a> {
    fn register(
        calls: &'a Mutex<HashMap<u64, CancellationToken>>,
        id: u64,
        token: CancellationToken,
    ) -> Self {
        calls.lock().insert(id, token);
        Self { calls, id }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.calls.lock().remove(&self.id);
    }
}

async fn collect(task: Option<tokio::task::JoinHandle<Vec<u8>>>) -> String {
    match task {
        Some(handle) => String::from_utf8_lossy(&handle.await.unwrap_or_default()).into_owned(),
        None => String::new(),
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        match i32::try_from(pid) {
            Ok(raw) => match kill(Pid::from_raw(raw), Signal::SIGTERM) {
                Ok(()) => {
                    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                        return;
                    }
                }
                Err(errno) => debug!(pid, error = %errno, "SIGTERM not delivered"),
            },
            Err(_) => debug!(pid, "pid out of range for SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    if let Err(e) = child.kill().await {
        debug!(error = %e, "child already gone");
    }
}

#[async_trait]
impl Agent for ProcessAgent {
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

    fn grace_period(&self) -> Duration {
        self.config.grace_period
    }

    async fn invoke(&self, prompt: &str) -> AgentResponse {
        self.call(&self.base_args(), prompt).await
    }

    async fn invoke_with_session(&self, session_id: &str, prompt: &str) -> AgentResponse {
        let mut args = self.base_args();
        let response = match &self.continuity {
            Continuity::Native {
                store,
                pattern,
                resume_flag,
            } => {
                let resumed = match store.context(session_id) {
                    SessionContext::Resume(token) => {
                        args.push(resume_flag.clone());
                        args.push(token);
                        true
                    }
                    _ => false,
                };
                let response = self.call(&args, prompt).await;
                if !resumed && response.success {
                    let token = response
                        .content
                        .as_deref()
                        .and_then(|out| pattern.captures(out))
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().to_string());
                    match token {
                        Some(token) => {
                            info!(agent = %self.config.name, session_id, "captured native session");
                            if let Err(e) = store.set_resume_token(session_id, &token) {
                                warn!(
                                    agent = %self.config.name,
                                    error = %e,
                                    "failed to persist resume token"
                                );
                            }
                        }
                        None => {
                            warn!(agent = %self.config.name, "no session token found in output")
                        }
                    }
                }
                response
            }
            Continuity::History(store) => {
                let full_prompt = match store.context(session_id) {
                    SessionContext::History(messages) => render_transcript(&messages, prompt),
                    _ => prompt.to_string(),
                };
                self.call(&args, &full_prompt).await
            }
        };
        if response.success {
            self.record_exchange(session_id, prompt, &response);
        }
        response.with_session(session_id)
    }

    async fn kill(&self) {
        let tokens: Vec<CancellationToken> =
            self.in_flight.lock().drain().map(|(_, t)| t).collect();
        if !tokens.is_empty() {
            info!(agent = %self.config.name, calls = tokens.len(), "killing in-flight process");
        }
        for token in tokens {
            token.cancel();
        }
    }

    fn clear_session(&self, session_id: &str) -> Result<(), crate::error::SessionError> {
        match &self.continuity {
            Continuity::Native { store, .. } => store.clear(session_id),
            Continuity::History(store) => store.clear(session_id),
        }
    }
}

/// Flattens stored history plus the new prompt into one stdin payload.
fn render_transcript(messages: &[ChatMessage], prompt: &str) -> String {
    let mut out = String::new();
    for m in messages {
        let label = match m.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        out.push_str(&format!("{label}: {}\n\n", m.content));
    }
    out.push_str(&format!("User: {prompt}"));
    out
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(name: &str, command: &str, args: &[&str], dir: &std::path::Path) -> ProcessAgentConfig {
        ProcessAgentConfig {
            name: name.into(),
            command: command.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            model: None,
            model_flag: None,
            timeout: Duration::from_secs(10),
            grace_period: Duration::from_millis(200),
            pricing: Pricing {
                input_per_1k: 1.0,
                output_per_1k: 2.0,
            },
            context_window: 1000,
            retry: RetryPolicy {
                max_retries: 1,
                base_delay_ms: 1,
            },
            session_pattern: None,
            resume_flag: None,
            sessions_dir: dir.to_path_buf(),
            history_max_messages: 20,
        }
    }

    #[tokio::test]
    async fn echoes_stdin_as_content() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ProcessAgent::new(config("cat", "cat", &[], dir.path())).unwrap();
        let response = agent.invoke("write chapter one").await;
        assert!(response.success, "{:?}", response.error);
        assert_eq!(response.content.as_deref(), Some("write chapter one"));
        assert!(response.tokens.total() > 0);
        assert!(response.cost.unwrap() > 0.0);
    }

    #[tokio::test]
    async fn reads_usage_line_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ProcessAgent::new(config(
            "usage",
            "sh",
            &["-c", r#"cat >/dev/null; echo '{"input_tokens": 120, "output_tokens": 30}'"#],
            dir.path(),
        ))
        .unwrap();
        let response = agent.invoke("hi").await;
        assert_eq!(response.tokens, TokenUsage::new(120, 30));
    }

    #[tokio::test]
    async fn non_zero_exit_is_failure_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ProcessAgent::new(config(
            "broken",
            "sh",
            &["-c", "echo 'bad flag' >&2; exit 3"],
            dir.path(),
        ))
        .unwrap();
        let response = agent.invoke("hi").await;
        assert!(!response.success);
        assert!(response.content.is_none());
        assert!(response.error.unwrap().contains("bad flag"));
    }

    #[tokio::test]
    async fn rate_limited_output_is_retried_then_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("calls");
        let script = format!(
            "echo x >> {}; echo 'Error: 429 Too Many Requests' >&2; exit 1",
            counter.display()
        );
        let agent =
            ProcessAgent::new(config("limited", "sh", &["-c", &script], dir.path())).unwrap();
        let response = agent.invoke("hi").await;
        assert!(!response.success);
        assert!(response.error.unwrap().starts_with("rate limited after 1 retries"));
        let calls = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(calls.lines().count(), 2);
    }

    #[tokio::test]
    async fn timeout_terminates_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config("slow", "sleep", &["30"], dir.path());
        cfg.timeout = Duration::from_millis(200);
        let agent = ProcessAgent::new(cfg).unwrap();
        let started = Instant::now();
        let response = agent.invoke("hi").await;
        assert!(!response.success);
        assert!(response.error.unwrap().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn kill_reaches_in_flight_child() {
        let dir = tempfile::tempdir().unwrap();
        let agent = Arc::new(ProcessAgent::new(config("slow", "sleep", &["30"], dir.path())).unwrap());
        let worker = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.invoke("hi").await })
        };
        // Wait for the call to register before killing it.
        for _ in 0..100 {
            if !agent.in_flight.lock().is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        agent.kill().await;
        let response = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(!response.success);
        assert!(response.error.unwrap().contains("killed"));
    }

    #[tokio::test]
    async fn kill_sends_sigterm_before_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let mark = dir.path().join("term");
        let script = format!(
            "trap 'echo term > {}; kill $!; exit 0' TERM; sleep 30 & wait",
            mark.display()
        );
        let mut cfg = config("trapper", "sh", &["-c", &script], dir.path());
        cfg.grace_period = Duration::from_secs(2);
        let agent = Arc::new(ProcessAgent::new(cfg).unwrap());
        let worker = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.invoke("hi").await })
        };
        for _ in 0..100 {
            if !agent.in_flight.lock().is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        // Give the shell time to install its trap.
        sleep(Duration::from_millis(200)).await;
        agent.kill().await;
        let response = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(!response.success);
        assert!(mark.exists(), "child never saw SIGTERM");
    }

    #[tokio::test]
    async fn dropped_call_unregisters_itself() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ProcessAgent::new(config("slow", "sleep", &["30"], dir.path())).unwrap();
        let outcome = tokio::time::timeout(Duration::from_millis(200), agent.invoke("hi")).await;
        assert!(outcome.is_err());
        assert!(agent.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn history_sessions_replay_previous_turns() {
        let dir = tempfile::tempdir().unwrap();
        let agent = ProcessAgent::new(config("cat", "cat", &[], dir.path())).unwrap();
        agent.invoke_with_session("run-1", "first").await;
        let second = agent.invoke_with_session("run-1", "second").await;
        let content = second.content.unwrap();
        assert!(content.starts_with("User: first"));
        assert!(content.ends_with("User: second"));
        assert_eq!(second.session_id.as_deref(), Some("run-1"));

        agent.clear_session("run-1").unwrap();
        let third = agent.invoke_with_session("run-1", "third").await;
        assert_eq!(third.content.as_deref(), Some("third"));
    }

    #[tokio::test]
    async fn native_sessions_capture_and_resume_token() {
        let dir = tempfile::tempdir().unwrap();
        // Prints its arguments so the test can see whether --resume was passed.
        let mut cfg = config(
            "native",
            "sh",
            &["-c", r#"cat >/dev/null; echo "session_id=sess-42 args:$*""#, "sh"],
            dir.path(),
        );
        cfg.session_pattern = Some(Regex::new(r"session_id=(\S+)").unwrap());
        cfg.resume_flag = Some("--resume".into());
        let agent = ProcessAgent::new(cfg).unwrap();

        let first = agent.invoke_with_session("run-1", "hello").await;
        assert!(!first.content.unwrap().contains("--resume"));

        let second = agent.invoke_with_session("run-1", "again").await;
        assert!(second.content.unwrap().contains("--resume sess-42"));
    }
}
