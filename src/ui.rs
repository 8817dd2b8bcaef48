//! Interface de terminal do quillflow: spinners, saída colorida e aprovação
//! humana pelo stdin.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`TerminalSink`] acompanha visualmente os
//! eventos de uma execução; o [`TerminalApprover`] coleta decisões humanas.

use std::io::BufRead;
use std::time::Duration;

use anyhow::Result;
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, warn};

use crate::orchestrator::{
    ApprovalDecision, ApprovalNotifier, ApprovalReason, ApprovalRequest, EventSink, RunHandle,
    WorkflowEvent,
};
use crate::state_machine::{RunOutcome, RunStatus};

/// Quantos caracteres do artefato são mostrados ao pedir aprovação.
const PREVIEW_CHARS: usize = 2000;

const TICK: Duration = Duration::from_millis(100);

/// Estilos compartilhados pelas saídas de terminal.
#[derive(Clone)]
struct Palette {
    green: Style,
    red: Style,
    yellow: Style,
    cyan: Style,
    dim: Style,
}

impl Palette {
    fn new() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            cyan: Style::new().cyan().bold(),
            dim: Style::new().dim(),
        }
    }
}

/// Indicador visual de progresso para uma execução de workflow.
///
/// Exibe um spinner com o estado atual e imprime transições, quebras do
/// circuit breaker e o resultado final acima dele.
pub struct TerminalSink {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    palette: Palette,
}

impl Default for TerminalSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalSink {
    pub fn new() -> Self {
        let pb = ProgressBar::new_spinner();
        // O template é estático; um erro aqui só mantém o estilo padrão.
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.enable_steady_tick(TICK);
        Self {
            pb,
            palette: Palette::new(),
        }
    }

    /// Aprovador que compartilha este spinner, para pausá-lo durante a leitura.
    pub fn approver(&self, handle: RunHandle) -> TerminalApprover {
        TerminalApprover {
            pb: self.pb.clone(),
            palette: self.palette.clone(),
            handle,
        }
    }

    fn line(&self, text: String) {
        self.pb.println(text);
    }
}

impl EventSink for TerminalSink {
    fn emit(&self, event: &WorkflowEvent) -> Result<()> {
        let p = &self.palette;
        match event {
            WorkflowEvent::RunStarted { run_id, start } => {
                self.line(format!(
                    "{} run {run_id} starting at '{start}'",
                    p.cyan.apply_to("▶")
                ));
            }
            WorkflowEvent::StateEntered { state, kind } => {
                self.pb.enable_steady_tick(TICK);
                self.pb.set_message(format!("{state} {}", p.dim.apply_to(kind)));
            }
            WorkflowEvent::StateCompleted {
                state,
                transition,
                succeeded,
                failed,
                cost,
            } => {
                let mark = if *failed == 0 {
                    p.green.apply_to("✓")
                } else {
                    p.yellow.apply_to("!")
                };
                self.line(format!(
                    "  {mark} {state}: {transition} ({succeeded} ok, {failed} failed, ${cost:.4})"
                ));
            }
            WorkflowEvent::Transition { from, to, label } => {
                debug!(%from, %to, %label, "transition");
            }
            WorkflowEvent::CircuitBreak { state, event } => {
                let style = if event.hard { &p.red } else { &p.yellow };
                self.line(format!(
                    "  {} circuit breaker at '{state}': {}",
                    style.apply_to("⚡"),
                    event.message
                ));
            }
            WorkflowEvent::AutoSkipped { from, to, score } => {
                self.line(format!(
                    "  {} auto-skip {from} → {to} (audit score {score}/10)",
                    p.yellow.apply_to("↷")
                ));
            }
            WorkflowEvent::Paused => self.pb.set_message("paused"),
            WorkflowEvent::Resumed => self.pb.set_message("resumed"),
            WorkflowEvent::Aborted { state } => {
                self.line(format!(
                    "  {} aborted{}",
                    p.red.apply_to("✗"),
                    state
                        .as_deref()
                        .map(|s| format!(" in '{s}'"))
                        .unwrap_or_default()
                ));
            }
            WorkflowEvent::ApprovalRequested { state } => {
                self.pb.disable_steady_tick();
                self.pb.set_message(format!("waiting for approval at '{state}'"));
            }
            WorkflowEvent::RunFinished { .. } => {
                self.pb.finish_and_clear();
            }
        }
        Ok(())
    }
}

/// Pergunta ao humano no terminal e devolve a decisão via [`RunHandle`].
///
/// Comandos aceitos: `approve`, `feedback <texto>` e `abort`. A leitura
/// roda numa thread própria para não bloquear o runtime.
pub struct TerminalApprover {
    pb: ProgressBar,
    palette: Palette,
    handle: RunHandle,
}

impl ApprovalNotifier for TerminalApprover {
    fn notify(&self, request: &ApprovalRequest) -> Result<()> {
        let p = &self.palette;
        self.pb.suspend(|| {
            println!();
            match &request.reason {
                ApprovalReason::Review => {
                    println!(
                        "{}",
                        p.cyan.apply_to(format!("─── Review: {} ───", request.state))
                    );
                }
                ApprovalReason::CircuitBreak { message } => {
                    println!(
                        "{}",
                        p.yellow
                            .apply_to(format!("─── Circuit breaker: {} ───", request.state))
                    );
                    println!("{message}");
                }
            }
            println!("{}", preview(&request.content));
            for (agent, audit) in &request.audits {
                println!(
                    "  {} {agent}: {}/10 {}",
                    p.dim.apply_to("•"),
                    audit.score(),
                    audit.decision()
                );
            }
            println!("{}", p.dim.apply_to("approve | feedback <text> | abort"));
        });

        let handle = self.handle.clone();
        std::thread::spawn(move || read_decision(handle));
        Ok(())
    }
}

fn read_decision(handle: RunHandle) {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        // A aprovação pode ter sido resolvida por outro caminho (timeout, abort).
        if !handle.approval_pending() {
            return;
        }
        let (decision, feedback) = match lines.next() {
            Some(Ok(line)) => match parse_decision(&line) {
                Some(parsed) => parsed,
                None => {
                    eprintln!("expected: approve | feedback <text> | abort");
                    continue;
                }
            },
            // Fim da entrada equivale a abortar.
            Some(Err(_)) | None => (ApprovalDecision::Abort, None),
        };
        if let Err(e) = handle.submit_approval(decision, feedback) {
            warn!(error = %e, "approval decision dropped");
        }
        return;
    }
}

/// Interpreta uma linha digitada pelo usuário.
pub fn parse_decision(line: &str) -> Option<(ApprovalDecision, Option<String>)> {
    let line = line.trim();
    let (command, rest) = match line.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (line, ""),
    };
    match command.to_ascii_lowercase().as_str() {
        "approve" | "approved" | "a" | "y" | "yes" => Some((ApprovalDecision::Approved, None)),
        "feedback" | "f" if !rest.is_empty() => {
            Some((ApprovalDecision::Feedback, Some(rest.to_string())))
        }
        "abort" | "q" | "quit" => Some((ApprovalDecision::Abort, None)),
        _ => None,
    }
}

fn preview(content: &str) -> String {
    match content.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}\n…", &content[..cut]),
        None => content.to_string(),
    }
}

/// Imprime o resultado final e o resumo de tokens e custo.
pub fn print_summary(outcome: &RunOutcome) {
    let p = Palette::new();
    println!();
    match outcome.status {
        RunStatus::Complete => println!(
            "  {} Run {} completed at '{}'",
            p.green.apply_to("✓"),
            outcome.run_id,
            outcome.final_state.as_deref().unwrap_or("?")
        ),
        status => println!(
            "  {} Run {} {status} at '{}': {}",
            p.red.apply_to("✗"),
            outcome.run_id,
            outcome
                .failed_state
                .as_deref()
                .or(outcome.final_state.as_deref())
                .unwrap_or("?"),
            outcome.error.as_deref().unwrap_or("no error recorded")
        ),
    }

    let summary = &outcome.summary;
    println!();
    println!("{}", p.cyan.apply_to("─── Usage ───"));
    println!(
        "  {} invocations, {} in / {} out tokens, ${:.4}",
        summary.invocations, summary.tokens.input, summary.tokens.output, summary.cost
    );
    for (name, agent) in &summary.agents {
        let health = agent.health.to_string();
        println!(
            "  {name:<16} {:>4} calls {:>8} tokens ${:>8.4}  context {:>5.1}% {}",
            agent.invocations,
            agent.tokens.total(),
            agent.cost,
            agent.context_usage_percent,
            p.dim.apply_to(health)
        );
    }
}
