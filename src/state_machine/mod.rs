mod audit;
mod definition;
mod run;

pub use audit::{
    AUDIT_OUTPUT_TYPES, AuditAggregate, AuditIssue, AuditResult, Decision, Severity,
    is_audit_output, parse_audit, try_parse_audit,
};
pub use definition::{StateDef, StateKind, TerminalOutcome, WorkflowDefinition};
pub use run::{FanOutResult, FanOutStatus, RunOutcome, RunStatus, StateResult, WorkflowRun};
