//! Stage result records.
//!
//! Every stage returns a typed result carrying partial cost and token data
//! even on the error path, so the pipeline can account for spend no matter
//! where execution stopped.

use serde::{Deserialize, Serialize};

use super::{CostBreakdown, DeveloperOutput, JudgeResult, RejectReason, TokenUsage, UsageBreakdown};

/// Outcome of Stage A (Developer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeveloperStageResult {
    pub output: DeveloperOutput,
    /// True when the stage was skipped on resume.
    #[serde(default)]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of Stage B (Git Validation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitValidationStageResult {
    /// The authoritative commit, when validation found one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub branch_name: String,
    /// True when the commit came from the auto-commit safety net.
    #[serde(default)]
    pub salvaged: bool,
    /// True when the SHA was only recovered from output markers.
    #[serde(default)]
    pub from_markers: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GitValidationStageResult {
    pub fn failure(branch_name: &str, error: impl Into<String>) -> Self {
        Self {
            commit_sha: None,
            branch_name: branch_name.to_string(),
            salvaged: false,
            from_markers: false,
            failed: true,
            error: Some(error.into()),
        }
    }
}

/// Outcome of Stage C (Judge).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeStageResult {
    pub result: JudgeResult,
    pub iteration: u32,
    pub max_retries: u32,
}

/// Outcome of Stage D (Merge).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergeStageResult {
    pub merged: bool,
    #[serde(default)]
    pub merge_conflict: bool,
    #[serde(default)]
    pub conflict_auto_resolved: bool,
    #[serde(default)]
    pub conflicted_files: Vec<String>,
    /// The conflict resolver's own explanation when it declared the merge
    /// unresolvable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_unresolvable_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_commit_sha: Option<String>,
    /// Cost of the AI conflict resolver, charged to the story.
    #[serde(default)]
    pub conflict_resolution_cost: f64,
    #[serde(default)]
    pub conflict_resolution_usage: TokenUsage,
}

/// Final result of one story pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryPipelineResult {
    pub story_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub branch_name: String,
    #[serde(default)]
    pub merged: bool,
    #[serde(default)]
    pub merge_conflict: bool,
    #[serde(default)]
    pub merge_conflict_auto_resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<RejectReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by_specialist: Option<String>,
    #[serde(default)]
    pub recovered_from_failure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_category: Option<String>,
    pub costs: CostBreakdown,
    pub usage: UsageBreakdown,
}

impl StoryPipelineResult {
    /// A zero-cost failure record for stages that were never reached.
    pub fn failed(story_id: &str, branch_name: &str, error: impl Into<String>) -> Self {
        Self {
            story_id: story_id.to_string(),
            success: false,
            commit_sha: None,
            branch_name: branch_name.to_string(),
            merged: false,
            merge_conflict: false,
            merge_conflict_auto_resolved: false,
            reject_reason: None,
            resolved_by_specialist: None,
            recovered_from_failure: false,
            original_error: Some(error.into()),
            failure_category: None,
            costs: CostBreakdown::default(),
            usage: UsageBreakdown::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_failure_carries_error() {
        let result = GitValidationStageResult::failure("story/S1-001", "no commits found");
        assert!(result.failed);
        assert!(result.commit_sha.is_none());
        assert_eq!(result.error.as_deref(), Some("no commits found"));
    }

    #[test]
    fn test_failed_pipeline_result_is_zero_cost() {
        let result = StoryPipelineResult::failed("S1", "story/S1-001", "boom");
        assert!(!result.success);
        assert_eq!(result.costs.total(), 0.0);
        assert_eq!(result.usage.developer, TokenUsage::default());
    }
}
