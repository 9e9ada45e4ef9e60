use serde::{Deserialize, Serialize};

/// A scoped slice of a task targeting exactly one repository, with its own
/// long-lived branch.
///
/// The epic branch is created from the repository's default branch before any
/// story on the epic runs, and exists on the remote for the epic's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    pub id: String,
    pub name: String,
    /// Name of the single repository this epic targets.
    pub repository: String,
    pub branch_name: String,
    #[serde(default)]
    pub story_ids: Vec<String>,
    /// Epic ids this epic depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// The smallest unit an agent implements: one commit chain, one developer,
/// one branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub title: String,
    pub epic_id: String,
    pub branch_name: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub status: StoryStatus,
}

/// Story lifecycle status, doubling as the checkpoint stage.
///
/// Pipeline stages form a total order; `rejected`, `failed` and
/// `merge_conflict` sit outside it. `merge_conflict` is the non-terminal
/// parked-for-human state: the branch is preserved and later stories
/// continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    #[default]
    NotStarted,
    CodeGenerating,
    CodeWritten,
    Pushed,
    JudgeEvaluating,
    MergedToEpic,
    Completed,
    Rejected,
    Failed,
    MergeConflict,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::CodeGenerating => "code_generating",
            Self::CodeWritten => "code_written",
            Self::Pushed => "pushed",
            Self::JudgeEvaluating => "judge_evaluating",
            Self::MergedToEpic => "merged_to_epic",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::MergeConflict => "merge_conflict",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "code_generating" => Ok(Self::CodeGenerating),
            "code_written" => Ok(Self::CodeWritten),
            "pushed" => Ok(Self::Pushed),
            "judge_evaluating" => Ok(Self::JudgeEvaluating),
            "merged_to_epic" => Ok(Self::MergedToEpic),
            "completed" => Ok(Self::Completed),
            "rejected" => Ok(Self::Rejected),
            "failed" => Ok(Self::Failed),
            "merge_conflict" => Ok(Self::MergeConflict),
            _ => Err(format!("Invalid story status: {}", s)),
        }
    }

    /// Position in the pipeline stage order, or None for statuses outside it.
    pub fn stage_rank(&self) -> Option<u8> {
        match self {
            Self::NotStarted => Some(0),
            Self::CodeGenerating => Some(1),
            Self::CodeWritten => Some(2),
            Self::Pushed => Some(3),
            Self::JudgeEvaluating => Some(4),
            Self::MergedToEpic => Some(5),
            Self::Completed => Some(6),
            Self::Rejected | Self::Failed | Self::MergeConflict => None,
        }
    }

    /// No further automated work happens from these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }

    /// The story counts against an epic's completion check.
    pub fn is_settled(&self) -> bool {
        self.is_terminal() || matches!(self, Self::MergeConflict)
    }

    /// Whether a checkpoint transition from `self` to `next` advances the
    /// pipeline. Transitions into the alternative terminals are always
    /// allowed; staged transitions must be monotonic.
    pub fn allows_transition_to(&self, next: StoryStatus) -> bool {
        match (self.stage_rank(), next.stage_rank()) {
            (Some(from), Some(to)) => to >= from,
            // Entering rejected/failed/merge_conflict is always permitted
            (_, None) => true,
            // Leaving a parked state re-enters the staged order
            (None, Some(_)) => matches!(self, Self::MergeConflict),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            StoryStatus::NotStarted,
            StoryStatus::CodeGenerating,
            StoryStatus::CodeWritten,
            StoryStatus::Pushed,
            StoryStatus::JudgeEvaluating,
            StoryStatus::MergedToEpic,
            StoryStatus::Completed,
            StoryStatus::Rejected,
            StoryStatus::Failed,
            StoryStatus::MergeConflict,
        ] {
            assert_eq!(StoryStatus::from_str(status.as_str()), Ok(status));
        }
        assert!(StoryStatus::from_str("bogus").is_err());
    }

    #[test]
    fn test_stage_order_is_total_over_pipeline_stages() {
        let order = [
            StoryStatus::NotStarted,
            StoryStatus::CodeGenerating,
            StoryStatus::CodeWritten,
            StoryStatus::Pushed,
            StoryStatus::JudgeEvaluating,
            StoryStatus::MergedToEpic,
            StoryStatus::Completed,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].stage_rank() < pair[1].stage_rank());
        }
    }

    #[test]
    fn test_terminals() {
        assert!(StoryStatus::Completed.is_terminal());
        assert!(StoryStatus::Rejected.is_terminal());
        assert!(StoryStatus::Failed.is_terminal());
        assert!(!StoryStatus::MergeConflict.is_terminal());
        assert!(StoryStatus::MergeConflict.is_settled());
        assert!(!StoryStatus::Pushed.is_terminal());
    }

    #[test]
    fn test_transitions_monotonic() {
        assert!(StoryStatus::CodeGenerating.allows_transition_to(StoryStatus::CodeWritten));
        assert!(StoryStatus::Pushed.allows_transition_to(StoryStatus::Pushed));
        assert!(!StoryStatus::Pushed.allows_transition_to(StoryStatus::CodeGenerating));
        assert!(StoryStatus::JudgeEvaluating.allows_transition_to(StoryStatus::Rejected));
        assert!(StoryStatus::MergeConflict.allows_transition_to(StoryStatus::MergedToEpic));
        assert!(!StoryStatus::Failed.allows_transition_to(StoryStatus::CodeGenerating));
    }
}
