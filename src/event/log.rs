use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::notify::Notifier;

use super::{Event, EventType, NewEvent, TaskSnapshot};

/// How many recent events per task the idempotent append inspects.
const DEDUPE_WINDOW: usize = 32;

/// Append-only persistent log of domain events, keyed by task id.
///
/// Appends are serialised through the connection lock; sequence numbers are
/// assigned by the store and are monotonically increasing.
pub struct EventLog {
    conn: Mutex<Connection>,
}

impl EventLog {
    /// Open (or create) the log at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open event log database")?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init()?;
        Ok(log)
    }

    /// In-memory log (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory event log")?;
        let log = Self {
            conn: Mutex::new(conn),
        };
        log.init()?;
        Ok(log)
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                type TEXT NOT NULL,
                agent TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                ts TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_task ON events(task_id, seq);
            ",
        )
        .context("Failed to create events table")?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Lock poisoning only happens if a holder panicked; the connection
        // itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event, assigning the next sequence number.
    pub fn append(&self, event: NewEvent) -> Result<Event> {
        let ts = Utc::now();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO events (task_id, type, agent, payload, ts) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.task_id,
                event.event_type.as_str(),
                event.agent,
                event.payload.to_string(),
                ts.to_rfc3339(),
            ],
        )
        .context("Failed to append event")?;
        let seq = conn.last_insert_rowid();
        Ok(Event {
            seq,
            task_id: event.task_id,
            event_type: event.event_type,
            agent: event.agent,
            payload: event.payload,
            ts,
        })
    }

    /// Idempotent append: when an event with the same (type, story, epic)
    /// composite exists within the recent window, the append is suppressed
    /// and still considered success.
    pub fn safe_append(&self, event: NewEvent) -> Result<Option<Event>> {
        let candidate = Event {
            seq: 0,
            task_id: event.task_id.clone(),
            event_type: event.event_type,
            agent: event.agent.clone(),
            payload: event.payload.clone(),
            ts: Utc::now(),
        };
        let recent = self.recent_events(&event.task_id, DEDUPE_WINDOW)?;
        let duplicate = recent.iter().any(|e| {
            e.event_type == candidate.event_type
                && e.story_id() == candidate.story_id()
                && e.epic_id() == candidate.epic_id()
        });
        if duplicate {
            tracing::debug!(
                task_id = %event.task_id,
                event_type = %event.event_type.as_str(),
                "suppressed duplicate event"
            );
            return Ok(None);
        }
        self.append(event).map(Some)
    }

    /// All events for a task, in sequence order.
    pub fn events_for_task(&self, task_id: &str) -> Result<Vec<Event>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT seq, task_id, type, agent, payload, ts FROM events
                 WHERE task_id = ?1 ORDER BY seq",
            )
            .context("Failed to prepare events query")?;
        let rows = stmt
            .query_map(params![task_id], row_to_event)
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?);
        }
        Ok(events)
    }

    fn recent_events(&self, task_id: &str, limit: usize) -> Result<Vec<Event>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT seq, task_id, type, agent, payload, ts FROM events
                 WHERE task_id = ?1 ORDER BY seq DESC LIMIT ?2",
            )
            .context("Failed to prepare recent events query")?;
        let rows = stmt
            .query_map(params![task_id, limit as i64], row_to_event)
            .context("Failed to query recent events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?);
        }
        Ok(events)
    }

    /// Fold all events for the task into a snapshot.
    pub fn current_state(&self, task_id: &str) -> Result<TaskSnapshot> {
        let events = self.events_for_task(task_id)?;
        Ok(TaskSnapshot::fold(&events))
    }

    /// Structural invariant violations in the task's folded state.
    pub fn validate_state(&self, task_id: &str) -> Result<Vec<String>> {
        Ok(self.current_state(task_id)?.validate())
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let type_str: String = row.get(2)?;
    let payload_str: String = row.get(4)?;
    let ts_str: String = row.get(5)?;
    Ok(Event {
        seq: row.get(0)?,
        task_id: row.get(1)?,
        event_type: EventType::from_str(&type_str).unwrap_or(EventType::StoryFailed),
        agent: row.get(3)?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        ts: DateTime::parse_from_rfc3339(&ts_str)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Best-effort confirmation that the story's branch tip exists on the remote.
///
/// Non-blocking: spawns a detached task and reports through the notifier; the
/// pipeline never waits on the outcome.
pub fn spawn_verify_story_push(
    task_id: String,
    story_id: String,
    branch: String,
    repo_path: std::path::PathBuf,
    notifier: Arc<dyn Notifier>,
) {
    tokio::spawn(async move {
        let output = tokio::process::Command::new("git")
            .args(["ls-remote", "--heads", "origin", &branch])
            .current_dir(&repo_path)
            .output()
            .await;

        let confirmed = match output {
            Ok(out) if out.status.success() => {
                !String::from_utf8_lossy(&out.stdout).trim().is_empty()
            }
            _ => false,
        };

        if !confirmed {
            tracing::warn!(%task_id, %story_id, %branch, "story push not confirmed on remote");
        }
        notifier.emit(
            &task_id,
            "story_push_verified",
            serde_json::json!({
                "story_id": story_id,
                "branch": branch,
                "confirmed": confirmed,
            }),
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_event(ty: EventType, payload: serde_json::Value) -> NewEvent {
        NewEvent::new("T1", ty, "test", payload)
    }

    #[test]
    fn test_append_assigns_monotonic_seq() {
        let log = EventLog::new_in_memory().unwrap();
        let a = log
            .append(new_event(EventType::EpicCreated, json!({"epic_id": "E1"})))
            .unwrap();
        let b = log
            .append(new_event(EventType::StoryCreated, json!({"story_id": "S1"})))
            .unwrap();
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_events_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        {
            let log = EventLog::new(&path).unwrap();
            log.append(new_event(EventType::EpicCreated, json!({"epic_id": "E1"})))
                .unwrap();
        }
        let log = EventLog::new(&path).unwrap();
        let events = log.events_for_task("T1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::EpicCreated);
    }

    #[test]
    fn test_safe_append_suppresses_duplicate() {
        let log = EventLog::new_in_memory().unwrap();
        let payload = json!({"story_id": "S1", "epic_id": "E1"});
        let first = log
            .safe_append(new_event(EventType::StoryCompleted, payload.clone()))
            .unwrap();
        assert!(first.is_some());
        let second = log
            .safe_append(new_event(EventType::StoryCompleted, payload))
            .unwrap();
        assert!(second.is_none());
        assert_eq!(log.events_for_task("T1").unwrap().len(), 1);
    }

    #[test]
    fn test_safe_append_distinct_stories_both_stored() {
        let log = EventLog::new_in_memory().unwrap();
        log.safe_append(new_event(
            EventType::StoryCompleted,
            json!({"story_id": "S1", "epic_id": "E1"}),
        ))
        .unwrap();
        log.safe_append(new_event(
            EventType::StoryCompleted,
            json!({"story_id": "S2", "epic_id": "E1"}),
        ))
        .unwrap();
        assert_eq!(log.events_for_task("T1").unwrap().len(), 2);
    }

    #[test]
    fn test_current_state_folds_events() {
        let log = EventLog::new_in_memory().unwrap();
        log.append(new_event(
            EventType::EpicCreated,
            json!({"epic": {
                "id": "E1", "name": "Auth", "repository": "api",
                "branch_name": "epic/E1", "story_ids": [], "depends_on": [],
            }}),
        ))
        .unwrap();
        log.append(new_event(
            EventType::StoryCreated,
            json!({"story": {
                "id": "S1", "title": "Login", "epic_id": "E1",
                "branch_name": "story/S1-001", "acceptance_criteria": [],
                "status": "not_started",
            }}),
        ))
        .unwrap();
        let snapshot = log.current_state("T1").unwrap();
        assert_eq!(snapshot.epics.len(), 1);
        assert_eq!(snapshot.story_branch("S1"), Some("story/S1-001"));
        assert!(log.validate_state("T1").unwrap().is_empty());
    }

    #[test]
    fn test_tasks_are_isolated() {
        let log = EventLog::new_in_memory().unwrap();
        log.append(NewEvent::new(
            "T1",
            EventType::EpicCreated,
            "test",
            json!({"epic_id": "E1"}),
        ))
        .unwrap();
        log.append(NewEvent::new(
            "T2",
            EventType::EpicCreated,
            "test",
            json!({"epic_id": "E2"}),
        ))
        .unwrap();
        assert_eq!(log.events_for_task("T1").unwrap().len(), 1);
        assert_eq!(log.events_for_task("T2").unwrap().len(), 1);
    }
}
