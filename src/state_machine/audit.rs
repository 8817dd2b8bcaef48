//! Audit verdicts: parsing agent output and combining several auditors.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AuditError;

/// Output types whose results are parsed as audit verdicts.
pub const AUDIT_OUTPUT_TYPES: [&str; 4] = ["audit", "review", "critique", "final_audit"];

pub fn is_audit_output(output_type: &str) -> bool {
    AUDIT_OUTPUT_TYPES.contains(&output_type)
}

/// Ordered from most to least permissive, so `max` picks the strictest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Proceed,
    Retry,
    Halt,
}

impl Decision {
    /// The transition label this decision produces.
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Proceed => "proceed",
            Decision::Retry => "retry",
            Decision::Halt => "halt",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proceed" => Some(Decision::Proceed),
            "retry" => Some(Decision::Retry),
            "halt" => Some(Decision::Halt),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditIssue {
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

/// A validated verdict. The score is always within 1..=10.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAudit")]
pub struct AuditResult {
    score: u8,
    decision: Decision,
    feedback: String,
    issues: Vec<AuditIssue>,
}

#[derive(Deserialize)]
struct RawAudit {
    score: i64,
    decision: String,
    #[serde(default)]
    feedback: String,
    #[serde(default)]
    issues: Vec<AuditIssue>,
}

impl TryFrom<RawAudit> for AuditResult {
    type Error = AuditError;

    fn try_from(raw: RawAudit) -> Result<Self, Self::Error> {
        let decision = Decision::parse(&raw.decision)
            .ok_or_else(|| AuditError::Invalid(format!("unknown decision '{}'", raw.decision)))?;
        AuditResult::new(raw.score, decision, raw.feedback, raw.issues)
    }
}

impl AuditResult {
    pub fn new(
        score: i64,
        decision: Decision,
        feedback: impl Into<String>,
        issues: Vec<AuditIssue>,
    ) -> Result<Self, AuditError> {
        let score = u8::try_from(score)
            .ok()
            .filter(|s| (1..=10).contains(s))
            .ok_or(AuditError::ScoreOutOfRange(score))?;
        Ok(Self {
            score,
            decision,
            feedback: feedback.into(),
            issues,
        })
    }

    /// Verdict used when an audit cannot be read: lowest score, retry.
    pub fn fail_closed(reason: impl fmt::Display) -> Self {
        Self {
            score: 1,
            decision: Decision::Retry,
            feedback: format!("Audit output could not be parsed ({reason}). Treating as retry."),
            issues: Vec::new(),
        }
    }

    pub fn score(&self) -> u8 {
        self.score
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn feedback(&self) -> &str {
        &self.feedback
    }

    pub fn issues(&self) -> &[AuditIssue] {
        &self.issues
    }

    /// Feedback plus issues, as injected into a retried prompt.
    pub fn render(&self) -> String {
        let mut out = format!("Score: {}/10, decision: {}", self.score, self.decision);
        if !self.feedback.trim().is_empty() {
            out.push_str("\n\n");
            out.push_str(self.feedback.trim());
        }
        for issue in &self.issues {
            let severity = match issue.severity {
                Severity::Critical => "critical",
                Severity::Major => "major",
                Severity::Minor => "minor",
            };
            out.push_str(&format!("\n- [{severity}] {}", issue.description));
            if let Some(fix) = &issue.suggested_fix {
                out.push_str(&format!(" (fix: {fix})"));
            }
        }
        out
    }
}

/// Parses an audit verdict, never failing: unreadable output yields the
/// fail-closed sentinel.
pub fn parse_audit(raw: &str) -> AuditResult {
    match try_parse_audit(raw) {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "audit output rejected, failing closed");
            AuditResult::fail_closed(e)
        }
    }
}

pub fn try_parse_audit(raw: &str) -> Result<AuditResult, AuditError> {
    let body = strip_fence(raw);
    let start = body.find('{').ok_or(AuditError::NoJson)?;
    let tail = &body[start..];

    let value = trim_to_json(tail)
        .or_else(|| {
            // Last resort: the longest brace-delimited prefix that parses.
            tail.char_indices()
                .filter(|&(_, c)| c == '}')
                .map(|(i, _)| i)
                .rev()
                .find_map(|end| parse_object(&tail[..=end]))
        })
        .ok_or_else(|| AuditError::Invalid("no parseable JSON object".into()))?;

    serde_json::from_value(value).map_err(|e| AuditError::Invalid(e.to_string()))
}

/// Removes one surrounding markdown code fence, if any.
fn strip_fence(raw: &str) -> &str {
    let Some(open) = raw.find("```") else {
        return raw;
    };
    let after = &raw[open + 3..];
    // Skip the info string (`json`) up to the end of the fence line.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    }
}

/// Tries the candidate as-is, then with trailing `}` removed one at a time.
fn trim_to_json(candidate: &str) -> Option<serde_json::Value> {
    let mut candidate = candidate.trim_end();
    loop {
        if let Some(value) = parse_object(candidate) {
            return Some(value);
        }
        candidate = candidate.strip_suffix('}')?.trim_end();
    }
}

fn parse_object(candidate: &str) -> Option<serde_json::Value> {
    match serde_json::from_str(candidate) {
        Ok(value @ serde_json::Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Combined verdict of every auditor in a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditAggregate {
    pub decision: Decision,
    pub score: u8,
    pub feedback: String,
    pub results: Vec<(String, AuditResult)>,
}

impl AuditAggregate {
    /// Strictest decision, lowest score, one `### agent` section each.
    /// Returns `None` when there is nothing to combine.
    pub fn combine(results: Vec<(String, AuditResult)>) -> Option<Self> {
        let decision = results.iter().map(|(_, r)| r.decision).max()?;
        let score = results.iter().map(|(_, r)| r.score).min()?;
        let feedback = results
            .iter()
            .map(|(agent, r)| format!("### {agent}\n{}", r.render()))
            .collect::<Vec<_>>()
            .join("\n\n");
        Some(Self {
            decision,
            score,
            feedback,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WELL_FORMED: &str =
        r#"{"score": 7, "decision": "proceed", "feedback": "Solid pacing.", "issues": []}"#;

    fn verdict(score: i64, decision: Decision) -> AuditResult {
        AuditResult::new(score, decision, format!("score {score}"), Vec::new()).unwrap()
    }

    #[test]
    fn score_outside_range_is_rejected() {
        for score in [-3, 0, 11, 255, 1000] {
            assert_eq!(
                AuditResult::new(score, Decision::Proceed, "", Vec::new()),
                Err(AuditError::ScoreOutOfRange(score))
            );
        }
        for score in 1..=10 {
            assert_eq!(verdict(score, Decision::Retry).score() as i64, score);
        }
    }

    #[test]
    fn fenced_json_with_trailing_braces_parses_like_clean_json() {
        let expected = try_parse_audit(WELL_FORMED).unwrap();
        for extra in 1..=3 {
            let raw = format!(
                "Here is my verdict:\n```json\n{WELL_FORMED}{}\n```\nThanks.",
                "}".repeat(extra)
            );
            assert_eq!(try_parse_audit(&raw).unwrap(), expected, "extra braces: {extra}");
        }
    }

    #[test]
    fn trailing_prose_falls_back_to_brace_substring() {
        let raw = format!("{WELL_FORMED} -- let me know if {{you}} need more");
        assert_eq!(try_parse_audit(&raw).unwrap().score(), 7);
    }

    #[test]
    fn issues_and_case_insensitive_decision() {
        let raw = r#"{
            "score": 4,
            "decision": "RETRY",
            "feedback": "Continuity breaks in chapter two.",
            "issues": [
                {"severity": "major", "description": "Timeline contradiction", "suggested_fix": "Move the flashback"},
                {"severity": "minor", "description": "Typo"}
            ]
        }"#;
        let audit = try_parse_audit(raw).unwrap();
        assert_eq!(audit.decision(), Decision::Retry);
        assert_eq!(audit.issues().len(), 2);
        assert_eq!(audit.issues()[0].severity, Severity::Major);
        assert!(audit.render().contains("- [major] Timeline contradiction (fix: Move the flashback)"));
    }

    #[test]
    fn malformed_output_fails_closed() {
        for raw in [
            "no json here",
            "{not json}",
            r#"{"score": 12, "decision": "proceed"}"#,
            r#"{"score": 8, "decision": "ship it"}"#,
            r#"{"decision": "proceed"}"#,
        ] {
            let audit = parse_audit(raw);
            assert_eq!(audit.score(), 1, "{raw}");
            assert_eq!(audit.decision(), Decision::Retry, "{raw}");
        }
    }

    #[test]
    fn aggregate_takes_strictest_decision_and_minimum_score() {
        let combined = AuditAggregate::combine(vec![
            ("continuity".into(), verdict(9, Decision::Proceed)),
            ("style".into(), verdict(4, Decision::Retry)),
        ])
        .unwrap();
        assert_eq!(combined.decision, Decision::Retry);
        assert_eq!(combined.score, 4);
        assert!(combined.feedback.contains("### continuity"));
        assert!(combined.feedback.contains("### style"));
    }

    #[test]
    fn aggregate_over_every_decision_combination() {
        let all = [Decision::Proceed, Decision::Retry, Decision::Halt];
        for a in all {
            for b in all {
                for c in all {
                    let combined = AuditAggregate::combine(vec![
                        ("a".into(), verdict(8, a)),
                        ("b".into(), verdict(5, b)),
                        ("c".into(), verdict(6, c)),
                    ])
                    .unwrap();
                    assert_eq!(combined.decision, a.max(b).max(c));
                    assert_eq!(combined.score, 5);
                }
            }
        }
        assert!(AuditAggregate::combine(Vec::new()).is_none());
    }

    #[test]
    fn audit_output_types() {
        assert!(is_audit_output("final_audit"));
        assert!(is_audit_output("critique"));
        assert!(!is_audit_output("draft"));
    }
}
