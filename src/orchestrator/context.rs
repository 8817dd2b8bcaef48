//! Prompt composition and pending feedback.

use std::fmt::Write;

pub const USER_FEEDBACK_TAG: &str = "[USER FEEDBACK - MUST INCORPORATE]";
pub const AUDITOR_FEEDBACK_TAG: &str = "[AUDITOR FEEDBACK]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackSource {
    User,
    Auditor,
}

/// Feedback waiting for the next execution of a state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingFeedback {
    pub source: FeedbackSource,
    pub text: String,
    /// Who reviewed and what they saw. Rendered ahead of the tag.
    pub reviewer_context: Option<String>,
}

impl PendingFeedback {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            source: FeedbackSource::User,
            text: text.into(),
            reviewer_context: None,
        }
    }

    pub fn auditor(text: impl Into<String>, reviewer_context: impl Into<String>) -> Self {
        Self {
            source: FeedbackSource::Auditor,
            text: text.into(),
            reviewer_context: Some(reviewer_context.into()),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self.source {
            FeedbackSource::User => USER_FEEDBACK_TAG,
            FeedbackSource::Auditor => AUDITOR_FEEDBACK_TAG,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(context) = &self.reviewer_context {
            out.push_str(context.trim());
            out.push_str("\n\n");
        }
        out.push_str(self.tag());
        out.push('\n');
        out.push_str(self.text.trim());
        out
    }
}

/// Everything that goes into one agent's prompt, in order.
#[derive(Debug, Default)]
pub struct PromptParts<'a> {
    pub persona: &'a str,
    pub instructions: Option<&'a str>,
    pub inputs: &'a [(String, String)],
    pub previous: &'a [(String, String)],
    pub feedback: &'a [PendingFeedback],
}

/// Persona first, then instructions and material, feedback last. Anything
/// from the first feedback tag onward is instruction, never persona.
pub fn compose_prompt(parts: &PromptParts<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();
    if !parts.persona.trim().is_empty() {
        sections.push(parts.persona.trim().to_string());
    }
    if let Some(instructions) = parts.instructions.filter(|i| !i.trim().is_empty()) {
        sections.push(instructions.trim().to_string());
    }
    for (label, content) in parts.inputs {
        let mut section = String::new();
        let _ = write!(section, "## Input: {label}\n\n{}", content.trim());
        sections.push(section);
    }
    for (label, content) in parts.previous {
        let mut section = String::new();
        let _ = write!(section, "## {label}\n\n{}", content.trim());
        sections.push(section);
    }
    for feedback in parts.feedback {
        sections.push(feedback.render());
    }
    sections.join("\n\n")
}

/// Substitutes `{key}` placeholders.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{key}}}"), value)
    })
}
