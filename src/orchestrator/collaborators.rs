//! Seams to the world outside the run loop: personas, output storage,
//! progress events and approval notifications.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::accounting::RunSummary;
use crate::circuit_breaker::BreakEvent;
use crate::state_machine::{AuditResult, RunStatus};

/// Resolves a persona reference into prompt text. An empty string means the
/// persona could not be loaded; the run continues without it.
pub trait PersonaResolver: Send + Sync {
    fn compose(&self, persona: &str) -> String;
}

/// Reads `<dir>/<persona>.md`.
#[derive(Debug, Clone)]
pub struct DirPersonaResolver {
    dir: PathBuf,
}

impl DirPersonaResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl PersonaResolver for DirPersonaResolver {
    fn compose(&self, persona: &str) -> String {
        let path = self.dir.join(format!("{persona}.md"));
        match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                warn!(persona, path = %path.display(), error = %e, "failed to load persona");
                String::new()
            }
        }
    }
}

/// Fixed personas, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticPersonas {
    personas: std::collections::HashMap<String, String>,
}

impl StaticPersonas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, persona: &str, text: &str) -> Self {
        self.personas.insert(persona.to_string(), text.to_string());
        self
    }
}

impl PersonaResolver for StaticPersonas {
    fn compose(&self, persona: &str) -> String {
        self.personas.get(persona).cloned().unwrap_or_default()
    }
}

/// One successful invocation, as handed to the output store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub run_id: String,
    pub state: String,
    pub output_type: Option<String>,
    pub agent: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

pub trait OutputStore: Send + Sync {
    fn save(&self, record: &OutputRecord) -> Result<()>;
}

/// Appends records to `<root>/<run_id>/outputs.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlOutputStore {
    root: PathBuf,
}

impl JsonlOutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id).join("outputs.jsonl")
    }
}

impl OutputStore for JsonlOutputStore {
    fn save(&self, record: &OutputRecord) -> Result<()> {
        let path = self.path_for(&record.run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryOutputStore {
    records: Mutex<Vec<OutputRecord>>,
}

impl MemoryOutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<OutputRecord> {
        self.records.lock().clone()
    }
}

impl OutputStore for MemoryOutputStore {
    fn save(&self, record: &OutputRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Progress stream emitted by the run loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    RunStarted {
        run_id: String,
        start: String,
    },
    StateEntered {
        state: String,
        kind: String,
    },
    StateCompleted {
        state: String,
        transition: String,
        succeeded: usize,
        failed: usize,
        cost: f64,
    },
    Transition {
        from: String,
        to: String,
        label: String,
    },
    CircuitBreak {
        state: String,
        event: BreakEvent,
    },
    AutoSkipped {
        from: String,
        to: String,
        score: u8,
    },
    Paused,
    Resumed,
    Aborted {
        state: Option<String>,
    },
    ApprovalRequested {
        state: String,
    },
    RunFinished {
        status: RunStatus,
        final_state: Option<String>,
        error: Option<String>,
        summary: RunSummary,
    },
}

/// Receives progress events. Failures are logged and otherwise ignored.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &WorkflowEvent) -> Result<()>;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &WorkflowEvent) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &WorkflowEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Why the run is asking a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalReason {
    /// A `human_approval` state was reached.
    Review,
    /// A soft circuit-breaker rule tripped and needs an override.
    CircuitBreak { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub run_id: String,
    pub state: String,
    pub reason: ApprovalReason,
    /// The artifact under review.
    pub content: String,
    /// The prompt the artifact answers.
    pub prompt: String,
    pub audits: Vec<(String, AuditResult)>,
    pub last_audit_score: Option<u8>,
}

/// Tells a human an approval is waiting. The decision comes back through
/// `RunHandle::submit_approval`.
pub trait ApprovalNotifier: Send + Sync {
    fn notify(&self, request: &ApprovalRequest) -> Result<()>;
}

/// Writes `content` to `path`, creating parent directories.
pub(crate) fn write_output_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("writing {}", path.display()))
}
