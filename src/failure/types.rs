use serde::{Deserialize, Serialize};

use crate::git::WorkspaceDetection;
use crate::model::DeveloperOutput;

/// Failure taxonomy. Terminal categories end the story; the rest are
/// recoverable through retry or salvage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    JudgeRejected,
    ApiError,
    ApiExhausted,
    UncommittedWork,
    UnpushedWork,
    NetworkTransient,
    Timeout,
    GitTransient,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JudgeRejected => "JUDGE_REJECTED",
            Self::ApiError => "API_ERROR",
            Self::ApiExhausted => "API_EXHAUSTED",
            Self::UncommittedWork => "UNCOMMITTED_WORK",
            Self::UnpushedWork => "UNPUSHED_WORK",
            Self::NetworkTransient => "NETWORK_TRANSIENT",
            Self::Timeout => "TIMEOUT",
            Self::GitTransient => "GIT_TRANSIENT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// What the recovery service should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Nothing more to do; the outcome stands.
    Accept,
    RetryWithBackoff,
    RetryWithMoreTime,
    RetryImmediate,
    AutoCommitAndContinue,
    SalvageAndJudge,
}

impl RecoveryStrategy {
    pub fn is_retry(&self) -> bool {
        matches!(
            self,
            Self::RetryWithBackoff | Self::RetryWithMoreTime | Self::RetryImmediate
        )
    }
}

/// How sure the classifier is about its verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Everything known about a failure at classification time.
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    pub error: String,
    pub retries_attempted: u32,
    pub developer_output: Option<DeveloperOutput>,
    pub workspace_detection: Option<WorkspaceDetection>,
    pub has_commits_on_branch: Option<bool>,
    pub elapsed_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    /// Stage the failure happened in, for evidence only.
    pub phase: String,
    pub judge_rejected: bool,
}

/// The classifier's verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureAnalysis {
    pub category: FailureCategory,
    pub strategy: RecoveryStrategy,
    pub is_terminal: bool,
    pub should_retry: bool,
    pub should_call_judge: bool,
    pub retry_delay_ms: u64,
    pub max_additional_retries: u32,
    pub evidence: Vec<String>,
    pub recommendations: Vec<String>,
    pub confidence: Confidence,
}
