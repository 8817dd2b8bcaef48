//! quillflow: a state-machine orchestrator for multi-agent content pipelines.
//!
//! A workflow is a TOML file of states and labelled transitions. The
//! [`orchestrator::Orchestrator`] walks it, fans prompts out to agents,
//! aggregates audits, and stops at a terminal state, a circuit break, or a
//! human decision.

pub mod accounting;
pub mod agents;
pub mod anthropic;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod session;
pub mod state_machine;
pub mod ui;
