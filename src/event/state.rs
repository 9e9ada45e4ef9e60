use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{EnvironmentConfig, Epic, Story, StoryStatus};

use super::{Event, EventType};

/// Snapshot of a task's state, produced by folding its event stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub epics: HashMap<String, Epic>,
    pub stories: HashMap<String, Story>,
    pub environment: EnvironmentConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub developers_completed_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    /// Fold an ordered event prefix into a snapshot. Deterministic: the same
    /// prefix always yields the same snapshot.
    pub fn fold(events: &[Event]) -> Self {
        let mut snapshot = Self::default();
        for event in events {
            snapshot.apply(event);
        }
        snapshot
    }

    fn apply(&mut self, event: &Event) {
        match event.event_type {
            EventType::EpicCreated => {
                if let Ok(epic) = serde_json::from_value::<Epic>(
                    event.payload.get("epic").cloned().unwrap_or_default(),
                ) {
                    self.epics.insert(epic.id.clone(), epic);
                }
            }
            EventType::StoryCreated => {
                if let Ok(story) = serde_json::from_value::<Story>(
                    event.payload.get("story").cloned().unwrap_or_default(),
                ) {
                    if let Some(epic) = self.epics.get_mut(&story.epic_id)
                        && !epic.story_ids.contains(&story.id)
                    {
                        epic.story_ids.push(story.id.clone());
                    }
                    self.stories.insert(story.id.clone(), story);
                }
            }
            EventType::DeveloperStarted => {
                if let Some(story) = event.story_id().and_then(|id| self.stories.get_mut(id)) {
                    story.status = StoryStatus::CodeGenerating;
                    // The definitive branch name for the story is whatever the
                    // developer was started on.
                    if let Some(branch) = event.payload.get("branch_name").and_then(|v| v.as_str())
                    {
                        story.branch_name = branch.to_string();
                    }
                }
            }
            EventType::StoryCompleted => {
                if let Some(story) = event.story_id().and_then(|id| self.stories.get_mut(id)) {
                    story.status = StoryStatus::Completed;
                }
            }
            EventType::StoryFailed => {
                let status = event
                    .payload
                    .get("status")
                    .and_then(|v| v.as_str())
                    .and_then(|s| StoryStatus::from_str(s).ok())
                    .unwrap_or(StoryStatus::Failed);
                if let Some(story) = event.story_id().and_then(|id| self.stories.get_mut(id)) {
                    story.status = status;
                }
            }
            EventType::DevelopersCompleted => {
                self.developers_completed_at = Some(event.ts);
            }
            EventType::EnvironmentConfigured => {
                if let Ok(environment) = serde_json::from_value::<EnvironmentConfig>(
                    event.payload.get("environment").cloned().unwrap_or_default(),
                ) {
                    self.environment = environment;
                }
            }
        }
    }

    /// Structural invariant violations, empty when the state is coherent.
    pub fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();

        for story in self.stories.values() {
            if !self.epics.contains_key(&story.epic_id) {
                violations.push(format!(
                    "story {} references unknown epic {}",
                    story.id, story.epic_id
                ));
            }
        }

        for epic in self.epics.values() {
            for story_id in &epic.story_ids {
                if !self.stories.contains_key(story_id) {
                    violations.push(format!(
                        "epic {} lists unknown story {}",
                        epic.id, story_id
                    ));
                }
            }
            if epic.branch_name.trim().is_empty() {
                violations.push(format!("epic {} has no branch name", epic.id));
            }
            if epic.repository.trim().is_empty() {
                violations.push(format!("epic {} targets no repository", epic.id));
            }
        }

        let mut branch_owners: HashMap<&str, &str> = HashMap::new();
        for story in self.stories.values() {
            if story.branch_name.trim().is_empty() {
                continue;
            }
            if let Some(other) = branch_owners.insert(story.branch_name.as_str(), story.id.as_str())
                && other != story.id
            {
                violations.push(format!(
                    "stories {} and {} share branch {}",
                    other, story.id, story.branch_name
                ));
            }
        }

        violations.sort();
        violations
    }

    /// The definitive branch name for a story, per the folded state.
    pub fn story_branch(&self, story_id: &str) -> Option<&str> {
        self.stories.get(story_id).map(|s| s.branch_name.as_str())
    }

    /// An epic is complete when all its stories are settled.
    pub fn epic_complete(&self, epic_id: &str) -> bool {
        match self.epics.get(epic_id) {
            Some(epic) => epic.story_ids.iter().all(|id| {
                self.stories
                    .get(id)
                    .map(|s| s.status.is_settled())
                    .unwrap_or(false)
            }),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(seq: i64, event_type: EventType, payload: serde_json::Value) -> Event {
        Event {
            seq,
            task_id: "T1".into(),
            event_type,
            agent: "test".into(),
            payload,
            ts: Utc::now(),
        }
    }

    fn epic_payload(id: &str) -> serde_json::Value {
        json!({"epic": {
            "id": id,
            "name": format!("Epic {id}"),
            "repository": "api",
            "branch_name": format!("epic/{id}"),
            "story_ids": [],
            "depends_on": [],
        }})
    }

    fn story_payload(id: &str, epic_id: &str) -> serde_json::Value {
        json!({"story": {
            "id": id,
            "title": format!("Story {id}"),
            "epic_id": epic_id,
            "branch_name": format!("story/{id}-001"),
            "acceptance_criteria": [],
            "status": "not_started",
        }})
    }

    #[test]
    fn test_fold_creates_epics_and_stories() {
        let events = vec![
            event(1, EventType::EpicCreated, epic_payload("E1")),
            event(2, EventType::StoryCreated, story_payload("S1", "E1")),
        ];
        let snapshot = TaskSnapshot::fold(&events);
        assert_eq!(snapshot.epics.len(), 1);
        assert_eq!(snapshot.stories.len(), 1);
        assert_eq!(snapshot.epics["E1"].story_ids, vec!["S1"]);
        assert!(snapshot.validate().is_empty());
    }

    #[test]
    fn test_fold_story_lifecycle() {
        let events = vec![
            event(1, EventType::EpicCreated, epic_payload("E1")),
            event(2, EventType::StoryCreated, story_payload("S1", "E1")),
            event(
                3,
                EventType::DeveloperStarted,
                json!({"story_id": "S1", "epic_id": "E1", "branch_name": "story/S1-001"}),
            ),
            event(
                4,
                EventType::StoryCompleted,
                json!({"story_id": "S1", "epic_id": "E1", "commit_sha": "c1"}),
            ),
        ];
        let snapshot = TaskSnapshot::fold(&events);
        assert_eq!(snapshot.stories["S1"].status, StoryStatus::Completed);
        assert!(snapshot.epic_complete("E1"));
    }

    #[test]
    fn test_fold_story_failed_honors_status() {
        let events = vec![
            event(1, EventType::EpicCreated, epic_payload("E1")),
            event(2, EventType::StoryCreated, story_payload("S1", "E1")),
            event(
                3,
                EventType::StoryFailed,
                json!({"story_id": "S1", "epic_id": "E1", "status": "rejected"}),
            ),
        ];
        let snapshot = TaskSnapshot::fold(&events);
        assert_eq!(snapshot.stories["S1"].status, StoryStatus::Rejected);
    }

    #[test]
    fn test_validate_flags_orphan_story() {
        let events = vec![event(1, EventType::StoryCreated, story_payload("S1", "E9"))];
        let snapshot = TaskSnapshot::fold(&events);
        let violations = snapshot.validate();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("unknown epic E9"));
    }

    #[test]
    fn test_validate_flags_shared_branch() {
        let mut s2 = story_payload("S2", "E1");
        s2["story"]["branch_name"] = json!("story/S1-001");
        let events = vec![
            event(1, EventType::EpicCreated, epic_payload("E1")),
            event(2, EventType::StoryCreated, story_payload("S1", "E1")),
            event(3, EventType::StoryCreated, s2),
        ];
        let snapshot = TaskSnapshot::fold(&events);
        assert!(
            snapshot
                .validate()
                .iter()
                .any(|v| v.contains("share branch"))
        );
    }

    #[test]
    fn test_developers_completed_timestamp() {
        let events = vec![event(
            1,
            EventType::DevelopersCompleted,
            json!({"successful": 1, "failed": 0}),
        )];
        let snapshot = TaskSnapshot::fold(&events);
        assert!(snapshot.developers_completed_at.is_some());
    }

    #[test]
    fn test_fold_is_deterministic() {
        let events = vec![
            event(1, EventType::EpicCreated, epic_payload("E1")),
            event(2, EventType::StoryCreated, story_payload("S1", "E1")),
            event(3, EventType::StoryCompleted, json!({"story_id": "S1"})),
        ];
        let a = serde_json::to_string(&TaskSnapshot::fold(&events)).unwrap();
        let b = serde_json::to_string(&TaskSnapshot::fold(&events)).unwrap();
        assert_eq!(a, b);
    }
}
