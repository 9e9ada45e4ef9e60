use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::StoryStatus;

/// Key for one story's checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub task_id: String,
    pub epic_id: String,
    pub story_id: String,
}

impl CheckpointKey {
    pub fn new(
        task_id: impl Into<String>,
        epic_id: impl Into<String>,
        story_id: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            epic_id: epic_id.into(),
            story_id: story_id.into(),
        }
    }
}

/// The durable progress record for one story.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryProgress {
    pub stage: StoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub cost_usd: f64,
    pub updated_at: DateTime<Utc>,
}

impl StoryProgress {
    pub fn at_stage(stage: StoryStatus) -> Self {
        Self {
            stage,
            commit_hash: None,
            sdk_session_id: None,
            files_modified: Vec::new(),
            files_created: Vec::new(),
            tools_used: Vec::new(),
            cost_usd: 0.0,
            updated_at: Utc::now(),
        }
    }
}

/// Optional extras written alongside a stage transition.
#[derive(Debug, Clone, Default)]
pub struct CheckpointExtra {
    pub commit_hash: Option<String>,
    pub sdk_session_id: Option<String>,
    pub files_modified: Option<Vec<String>>,
    pub files_created: Option<Vec<String>>,
    pub tools_used: Option<Vec<String>>,
    pub cost_usd: Option<f64>,
}

impl CheckpointExtra {
    pub fn with_commit(sha: impl Into<String>) -> Self {
        Self {
            commit_hash: Some(sha.into()),
            ..Default::default()
        }
    }
}

/// SDK session state for resuming an agent conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCheckpoint {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_uuid: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_at_stage_defaults() {
        let progress = StoryProgress::at_stage(StoryStatus::CodeGenerating);
        assert_eq!(progress.stage, StoryStatus::CodeGenerating);
        assert!(progress.commit_hash.is_none());
        assert_eq!(progress.cost_usd, 0.0);
    }

    #[test]
    fn test_extra_with_commit() {
        let extra = CheckpointExtra::with_commit("abc");
        assert_eq!(extra.commit_hash.as_deref(), Some("abc"));
        assert!(extra.sdk_session_id.is_none());
    }
}
