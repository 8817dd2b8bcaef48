//! Pause, resume, abort and approval handoffs between the run loop and
//! whoever is driving it from outside.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info};

use crate::error::OrchestratorError;

/// How often a paused loop re-checks its signal even without a wakeup.
const PAUSE_RECHECK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Running,
    Paused,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approved,
    Feedback,
    Abort,
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalDecision::Approved => write!(f, "approved"),
            ApprovalDecision::Feedback => write!(f, "feedback"),
            ApprovalDecision::Abort => write!(f, "abort"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub decision: ApprovalDecision,
    pub feedback: Option<String>,
}

impl ApprovalResponse {
    /// Only `feedback` decisions keep their text; blank text is dropped.
    pub fn new(decision: ApprovalDecision, feedback: Option<String>) -> Self {
        let feedback = match decision {
            ApprovalDecision::Feedback => feedback
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty()),
            _ => None,
        };
        Self { decision, feedback }
    }

    pub fn abort() -> Self {
        Self::new(ApprovalDecision::Abort, None)
    }
}

/// Result of blocking on an approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalWait {
    Decided(ApprovalResponse),
    Aborted,
    TimedOut,
}

struct ControlInner {
    signal: watch::Sender<ControlState>,
    approval: Mutex<Option<oneshot::Sender<ApprovalResponse>>>,
}

/// Cloneable control surface for a run. Safe to use from any task or thread.
#[derive(Clone)]
pub struct RunHandle {
    inner: Arc<ControlInner>,
}

impl Default for RunHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RunHandle {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(ControlState::Running);
        Self {
            inner: Arc::new(ControlInner {
                signal,
                approval: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ControlState {
        *self.inner.signal.borrow()
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == ControlState::Aborted
    }

    /// Back to `Running` for a fresh run, dropping any stale approval.
    pub(crate) fn reset(&self) {
        self.inner.signal.send_replace(ControlState::Running);
        self.inner.approval.lock().take();
    }

    pub fn pause(&self) {
        self.inner.signal.send_if_modified(|state| {
            if *state == ControlState::Running {
                *state = ControlState::Paused;
                true
            } else {
                false
            }
        });
    }

    pub fn resume(&self) {
        self.inner.signal.send_if_modified(|state| {
            if *state == ControlState::Paused {
                *state = ControlState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Aborts the run and releases both the pause wait and any pending
    /// approval wait.
    pub fn abort(&self) {
        info!("abort requested");
        self.inner.signal.send_replace(ControlState::Aborted);
        if let Some(tx) = self.inner.approval.lock().take() {
            let _ = tx.send(ApprovalResponse::abort());
        }
    }

    pub fn approval_pending(&self) -> bool {
        self.inner.approval.lock().is_some()
    }

    /// Delivers the single decision for the pending approval.
    pub fn submit_approval(
        &self,
        decision: ApprovalDecision,
        feedback: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let tx = self
            .inner
            .approval
            .lock()
            .take()
            .ok_or(OrchestratorError::NoPendingApproval)?;
        tx.send(ApprovalResponse::new(decision, feedback))
            .map_err(|_| OrchestratorError::NoPendingApproval)
    }

    /// Registers the slot `submit_approval` fills.
    pub(crate) fn await_approval(&self) -> oneshot::Receiver<ApprovalResponse> {
        let (tx, rx) = oneshot::channel();
        *self.inner.approval.lock() = Some(tx);
        rx
    }

    /// Blocks until a decision arrives, the run is aborted, or `limit` elapses.
    pub(crate) async fn wait_for_approval(
        &self,
        rx: oneshot::Receiver<ApprovalResponse>,
        limit: Duration,
    ) -> ApprovalWait {
        let outcome = tokio::select! {
            response = rx => match response {
                Ok(response) if response.decision == ApprovalDecision::Abort => {
                    ApprovalWait::Aborted
                }
                Ok(response) => ApprovalWait::Decided(response),
                Err(_) => ApprovalWait::Aborted,
            },
            _ = self.aborted() => ApprovalWait::Aborted,
            _ = tokio::time::sleep(limit) => ApprovalWait::TimedOut,
        };
        self.inner.approval.lock().take();
        debug!(?outcome, "approval wait finished");
        outcome
    }

    /// Waits out a pause. Returns false if the run was aborted instead.
    pub(crate) async fn wait_while_paused(&self) -> bool {
        let mut rx = self.inner.signal.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ControlState::Running => return true,
                ControlState::Aborted => return false,
                ControlState::Paused => {}
            }
            // Timeout only bounds a single wait; the loop re-checks.
            let _ = tokio::time::timeout(PAUSE_RECHECK, rx.changed()).await;
        }
    }

    /// Resolves once the run is aborted.
    pub(crate) async fn aborted(&self) {
        let mut rx = self.inner.signal.subscribe();
        loop {
            if *rx.borrow_and_update() == ControlState::Aborted {
                return;
            }
            if rx.changed().await.is_err() {
                // The sender lives as long as the handle; unreachable in practice.
                std::future::pending::<()>().await;
            }
        }
    }
}
