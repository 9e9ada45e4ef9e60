//! Marker parsing from agent stdout.
//!
//! Agents report outcomes through conventional markers; the orchestrator
//! treats them as hints, with git as the final authority. Matching is
//! markdown-insensitive: bold, headers, list bullets and backticks are
//! stripped before comparison, and the emoji prefixes are optional.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::model::RejectReason;
use crate::util::extract_json_object;

static COMMIT_SHA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)commit sha:\s*`?([0-9a-f]{40})`?").expect("commit sha pattern compiles")
});

static FAILED_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*❌?\s*FAILED\b").expect("failed pattern compiles"));

static UNRESOLVABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"CONFLICT_UNRESOLVABLE:?\s*(.*)").expect("unresolvable pattern compiles")
});

/// Strip markdown decoration so markers match regardless of formatting.
pub fn strip_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let mut line = line.trim_start();
        // Header and blockquote prefixes
        while let Some(rest) = line
            .strip_prefix('#')
            .or_else(|| line.strip_prefix('>'))
        {
            line = rest.trim_start();
        }
        // List bullets
        if let Some(rest) = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "))
            .or_else(|| line.strip_prefix("+ "))
        {
            line = rest;
        }
        let cleaned = line.replace("**", "").replace("__", "").replace('`', "");
        out.push_str(&cleaned);
        out.push('\n');
    }
    out
}

/// Developer completion marker: `✅ DEVELOPER_FINISHED_SUCCESSFULLY` or
/// `✅ FINISHED_SUCCESSFULLY`.
pub fn developer_finished(output: &str) -> bool {
    let stripped = strip_markdown(output);
    stripped.contains("DEVELOPER_FINISHED_SUCCESSFULLY") || stripped.contains("FINISHED_SUCCESSFULLY")
}

/// Explicit developer failure marker: a line starting with `❌ FAILED` (or
/// bare `FAILED`). Substrings inside sentences do not count.
pub fn developer_failed(output: &str) -> bool {
    let stripped = strip_markdown(output);
    if developer_finished(&stripped) {
        return false;
    }
    FAILED_LINE_RE.is_match(&stripped)
}

/// Extract a reported commit from `📍 Commit SHA: <40-hex>`.
pub fn extract_commit_sha(output: &str) -> Option<String> {
    let stripped = strip_markdown(output);
    COMMIT_SHA_RE
        .captures(&stripped)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// Build-check signal markers. Present markers yield Some; an absent check
/// yields None.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildSignals {
    pub typecheck: Option<bool>,
    pub tests: Option<bool>,
    pub lint: Option<bool>,
    pub build: Option<bool>,
}

pub fn parse_build_signals(output: &str) -> BuildSignals {
    let stripped = strip_markdown(output);
    let signal = |passed: &str, failed: &str| -> Option<bool> {
        if stripped.contains(passed) {
            Some(true)
        } else if stripped.contains(failed) {
            Some(false)
        } else {
            None
        }
    };
    BuildSignals {
        typecheck: signal("TYPECHECK_PASSED", "TYPECHECK_FAILED"),
        tests: signal("TESTS_PASSED", "TESTS_FAILED"),
        lint: signal("LINT_PASSED", "LINT_FAILED"),
        build: signal("BUILD_PASSED", "BUILD_FAILED"),
    }
}

/// A judge verdict recovered from agent output.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub approved: bool,
    pub score: Option<f32>,
    pub feedback: String,
    pub reject_reason: Option<RejectReason>,
}

#[derive(Debug, Deserialize)]
struct JudgeVerdictJson {
    approved: bool,
    #[serde(default)]
    score: Option<f32>,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    reject_reason: Option<String>,
}

/// Parse the judge's verdict: structured JSON first, marker fallback.
pub fn parse_judge_verdict(output: &str) -> Option<JudgeVerdict> {
    if let Some(json) = extract_json_object(output)
        && let Ok(parsed) = serde_json::from_str::<JudgeVerdictJson>(&json)
    {
        return Some(JudgeVerdict {
            approved: parsed.approved,
            score: parsed.score,
            feedback: parsed.feedback.unwrap_or_default(),
            reject_reason: parsed
                .reject_reason
                .as_deref()
                .and_then(|r| RejectReason::from_str(r).ok()),
        });
    }

    let stripped = strip_markdown(output);
    if stripped.contains("APPROVED") && !stripped.contains("REJECTED") {
        return Some(JudgeVerdict {
            approved: true,
            score: None,
            feedback: String::new(),
            reject_reason: None,
        });
    }
    if stripped.contains("REJECTED") {
        return Some(JudgeVerdict {
            approved: false,
            score: None,
            feedback: stripped.trim().to_string(),
            reject_reason: Some(RejectReason::Other),
        });
    }
    None
}

/// The conflict resolver's verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictVerdict {
    pub resolved: bool,
    pub reason: Option<String>,
}

pub fn parse_conflict_verdict(output: &str) -> Option<ConflictVerdict> {
    let stripped = strip_markdown(output);
    if stripped.contains("CONFLICT_RESOLVED") {
        return Some(ConflictVerdict {
            resolved: true,
            reason: None,
        });
    }
    if let Some(cap) = UNRESOLVABLE_RE.captures(&stripped) {
        let reason = cap
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty());
        return Some(ConflictVerdict {
            resolved: false,
            reason,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_developer_finished_plain() {
        assert!(developer_finished("✅ DEVELOPER_FINISHED_SUCCESSFULLY"));
        assert!(developer_finished("work done\nFINISHED_SUCCESSFULLY\n"));
        assert!(!developer_finished("still working on it"));
    }

    #[test]
    fn test_developer_finished_markdown_decorated() {
        assert!(developer_finished("**✅ DEVELOPER_FINISHED_SUCCESSFULLY**"));
        assert!(developer_finished("## ✅ FINISHED_SUCCESSFULLY"));
        assert!(developer_finished("- `DEVELOPER_FINISHED_SUCCESSFULLY`"));
    }

    #[test]
    fn test_developer_failed_line() {
        assert!(developer_failed("❌ FAILED"));
        assert!(developer_failed("some context\nFAILED: could not build\n"));
        assert!(developer_failed("**❌ FAILED**"));
    }

    #[test]
    fn test_developer_failed_not_in_sentence() {
        assert!(!developer_failed("the previous attempt FAILED but I fixed it"));
    }

    #[test]
    fn test_finished_beats_failed() {
        let output = "earlier step FAILED\n✅ DEVELOPER_FINISHED_SUCCESSFULLY\n";
        assert!(developer_finished(output));
        assert!(!developer_failed(output));
    }

    #[test]
    fn test_extract_commit_sha() {
        let sha = "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0";
        let output = format!("📍 Commit SHA: {}", sha);
        assert_eq!(extract_commit_sha(&output), Some(sha.to_string()));
    }

    #[test]
    fn test_extract_commit_sha_markdown_and_case() {
        let sha = "A1B2C3D4E5F6A7B8C9D0E1F2A3B4C5D6E7F8A9B0";
        let output = format!("**Commit SHA:** `{}`", sha);
        assert_eq!(extract_commit_sha(&output), Some(sha.to_lowercase()));
    }

    #[test]
    fn test_extract_commit_sha_rejects_short_hash() {
        assert_eq!(extract_commit_sha("Commit SHA: abc123"), None);
    }

    #[test]
    fn test_build_signals() {
        let output = "✅ TYPECHECK_PASSED\n❌ TESTS_FAILED\n";
        let signals = parse_build_signals(output);
        assert_eq!(signals.typecheck, Some(true));
        assert_eq!(signals.tests, Some(false));
        assert_eq!(signals.lint, None);
        assert_eq!(signals.build, None);
    }

    #[test]
    fn test_judge_verdict_structured_json() {
        let output = r#"After review: {"approved": false, "score": 3.5, "feedback": "placeholder code in auth.rs", "reject_reason": "placeholder_code"}"#;
        let verdict = parse_judge_verdict(output).unwrap();
        assert!(!verdict.approved);
        assert_eq!(verdict.score, Some(3.5));
        assert_eq!(verdict.reject_reason, Some(RejectReason::PlaceholderCode));
    }

    #[test]
    fn test_judge_verdict_marker_approved() {
        let verdict = parse_judge_verdict("✅ APPROVED").unwrap();
        assert!(verdict.approved);
    }

    #[test]
    fn test_judge_verdict_marker_rejected() {
        let verdict = parse_judge_verdict("❌ REJECTED: scope creep").unwrap();
        assert!(!verdict.approved);
        assert_eq!(verdict.reject_reason, Some(RejectReason::Other));
    }

    #[test]
    fn test_judge_verdict_absent() {
        assert!(parse_judge_verdict("no verdict here").is_none());
    }

    #[test]
    fn test_conflict_verdict_resolved() {
        let verdict = parse_conflict_verdict("✅ CONFLICT_RESOLVED").unwrap();
        assert!(verdict.resolved);
        assert!(verdict.reason.is_none());
    }

    #[test]
    fn test_conflict_verdict_unresolvable_with_reason() {
        let verdict =
            parse_conflict_verdict("❌ CONFLICT_UNRESOLVABLE: incompatible schema changes")
                .unwrap();
        assert!(!verdict.resolved);
        assert_eq!(
            verdict.reason.as_deref(),
            Some("incompatible schema changes")
        );
    }

    #[test]
    fn test_conflict_verdict_absent() {
        assert!(parse_conflict_verdict("still thinking").is_none());
    }

    #[test]
    fn test_strip_markdown_preserves_content() {
        let stripped = strip_markdown("## **Header** with `code`\n- item one\n");
        assert!(stripped.contains("Header with code"));
        assert!(stripped.contains("item one"));
    }
}
