use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Domain event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    EpicCreated,
    StoryCreated,
    DeveloperStarted,
    StoryCompleted,
    StoryFailed,
    DevelopersCompleted,
    EnvironmentConfigured,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EpicCreated => "EpicCreated",
            Self::StoryCreated => "StoryCreated",
            Self::DeveloperStarted => "DeveloperStarted",
            Self::StoryCompleted => "StoryCompleted",
            Self::StoryFailed => "StoryFailed",
            Self::DevelopersCompleted => "DevelopersCompleted",
            Self::EnvironmentConfigured => "EnvironmentConfigured",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "EpicCreated" => Ok(Self::EpicCreated),
            "StoryCreated" => Ok(Self::StoryCreated),
            "DeveloperStarted" => Ok(Self::DeveloperStarted),
            "StoryCompleted" => Ok(Self::StoryCompleted),
            "StoryFailed" => Ok(Self::StoryFailed),
            "DevelopersCompleted" => Ok(Self::DevelopersCompleted),
            "EnvironmentConfigured" => Ok(Self::EnvironmentConfigured),
            _ => Err(format!("Invalid event type: {}", s)),
        }
    }
}

/// One record in the append-only stream.
///
/// Sequence numbers are assigned by the log and are monotonically increasing
/// per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub task_id: String,
    pub event_type: EventType,
    /// Name of the agent (or component) that produced the event.
    pub agent: String,
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl Event {
    /// Story id from the payload, when present. Used for dedupe.
    pub fn story_id(&self) -> Option<&str> {
        payload_str(&self.payload, "story_id")
            .or_else(|| self.payload.get("story").and_then(|s| s.get("id")).and_then(|v| v.as_str()))
    }

    /// Epic id from the payload, when present. Used for dedupe.
    pub fn epic_id(&self) -> Option<&str> {
        payload_str(&self.payload, "epic_id")
            .or_else(|| self.payload.get("epic").and_then(|e| e.get("id")).and_then(|v| v.as_str()))
    }
}

fn payload_str<'a>(payload: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(|v| v.as_str())
}

/// An event not yet appended; the log assigns seq and timestamp.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub task_id: String,
    pub event_type: EventType,
    pub agent: String,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(
        task_id: impl Into<String>,
        event_type: EventType,
        agent: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            event_type,
            agent: agent.into(),
            payload,
        }
    }
}
