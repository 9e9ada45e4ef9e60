use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Token counts for one agent invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input += other.input;
        self.output += other.output;
    }

    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// Structured result a developer agent must return.
///
/// The commit SHA here and the git object graph are the only authorities on
/// what code was produced; everything else is a hint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeveloperOutput {
    pub success: bool,
    /// Empty when the agent did not finish cleanly.
    #[serde(default)]
    pub commit_sha: String,
    pub branch_name: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    pub cost_usd: f64,
    pub tokens: TokenUsage,
    pub completed_at: DateTime<Utc>,
    pub story_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
}

impl DeveloperOutput {
    /// A failure record with no work attached, for error paths that still
    /// need accounting.
    pub fn failed(story_id: &str, branch_name: &str) -> Self {
        Self {
            success: false,
            commit_sha: String::new(),
            branch_name: branch_name.to_string(),
            files_modified: Vec::new(),
            files_created: Vec::new(),
            tools_used: Vec::new(),
            cost_usd: 0.0,
            tokens: TokenUsage::default(),
            completed_at: Utc::now(),
            story_id: story_id.to_string(),
            raw_response: None,
            sdk_session_id: None,
        }
    }

    pub fn has_commit(&self) -> bool {
        self.commit_sha.len() == 40 && self.commit_sha.chars().all(|c| c.is_ascii_hexdigit())
    }
}

/// Why a judge rejected a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Conflicts,
    CodeIssues,
    ScopeViolation,
    PlaceholderCode,
    MissingFiles,
    Other,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflicts => "conflicts",
            Self::CodeIssues => "code_issues",
            Self::ScopeViolation => "scope_violation",
            Self::PlaceholderCode => "placeholder_code",
            Self::MissingFiles => "missing_files",
            Self::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "conflicts" => Ok(Self::Conflicts),
            "code_issues" => Ok(Self::CodeIssues),
            "scope_violation" => Ok(Self::ScopeViolation),
            "placeholder_code" => Ok(Self::PlaceholderCode),
            "missing_files" => Ok(Self::MissingFiles),
            "other" => Ok(Self::Other),
            _ => Err(format!("Invalid reject reason: {}", s)),
        }
    }
}

/// Everything the judge is given: the exact commit, the branch it lives on,
/// the workspace, and the story's acceptance criteria.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeInput {
    pub task_id: String,
    pub story_id: String,
    pub story_title: String,
    pub commit_sha: String,
    pub branch_name: String,
    pub workspace_path: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    /// Build verification outcome, recorded for context; never blocks the
    /// judge from running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_check: Option<BuildCheckOutcome>,
}

/// Result of the optional pre-judge build verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildCheckOutcome {
    pub typecheck_passed: Option<bool>,
    pub tests_passed: Option<bool>,
    pub lint_passed: Option<bool>,
    pub build_passed: Option<bool>,
}

impl BuildCheckOutcome {
    pub fn all_passed(&self) -> bool {
        [
            self.typecheck_passed,
            self.tests_passed,
            self.lint_passed,
            self.build_passed,
        ]
        .iter()
        .all(|c| c.unwrap_or(true))
    }
}

/// The judge's verdict on one commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeResult {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(default)]
    pub feedback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<RejectReason>,
    pub cost_usd: f64,
    pub tokens: TokenUsage,
}

/// Per-role cost aggregation for one story.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub developer: f64,
    pub judge: f64,
    pub conflict_resolution: f64,
}

impl CostBreakdown {
    pub fn total(&self) -> f64 {
        self.developer + self.judge + self.conflict_resolution
    }
}

/// Per-role token aggregation for one story.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBreakdown {
    pub developer: TokenUsage,
    pub judge: TokenUsage,
    pub conflict_resolution: TokenUsage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_add() {
        let mut usage = TokenUsage::new(100, 20);
        usage.add(TokenUsage::new(50, 5));
        assert_eq!(usage, TokenUsage::new(150, 25));
        assert_eq!(usage.total(), 175);
    }

    #[test]
    fn test_developer_output_has_commit() {
        let mut output = DeveloperOutput::failed("S1", "story/S1-001");
        assert!(!output.has_commit());
        output.commit_sha = "a".repeat(40);
        assert!(output.has_commit());
        output.commit_sha = "zz".repeat(20);
        assert!(!output.has_commit());
    }

    #[test]
    fn test_reject_reason_roundtrip() {
        for reason in [
            RejectReason::Conflicts,
            RejectReason::CodeIssues,
            RejectReason::ScopeViolation,
            RejectReason::PlaceholderCode,
            RejectReason::MissingFiles,
            RejectReason::Other,
        ] {
            assert_eq!(RejectReason::from_str(reason.as_str()), Ok(reason));
        }
    }

    #[test]
    fn test_build_check_all_passed_treats_absent_as_pass() {
        let check = BuildCheckOutcome {
            tests_passed: Some(true),
            ..Default::default()
        };
        assert!(check.all_passed());

        let check = BuildCheckOutcome {
            tests_passed: Some(false),
            ..Default::default()
        };
        assert!(!check.all_passed());
    }

    #[test]
    fn test_cost_breakdown_total() {
        let costs = CostBreakdown {
            developer: 1.25,
            judge: 0.5,
            conflict_resolution: 0.25,
        };
        assert!((costs.total() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_developer_output_event_payload_roundtrip() {
        let output = DeveloperOutput {
            success: true,
            commit_sha: "b".repeat(40),
            branch_name: "story/S1-001".into(),
            files_modified: vec!["src/lib.rs".into()],
            files_created: vec![],
            tools_used: vec!["edit".into()],
            cost_usd: 0.42,
            tokens: TokenUsage::new(1000, 200),
            completed_at: Utc::now(),
            story_id: "S1".into(),
            raw_response: None,
            sdk_session_id: Some("sess-1".into()),
        };
        let payload = serde_json::to_value(&output).unwrap();
        let back: DeveloperOutput = serde_json::from_value(payload).unwrap();
        assert_eq!(back.commit_sha, output.commit_sha);
        assert_eq!(back.tokens, output.tokens);
        assert_eq!(back.sdk_session_id, output.sdk_session_id);
    }
}
