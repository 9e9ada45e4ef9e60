use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::PipelineError;
use crate::model::StoryStatus;

use super::{CheckpointExtra, CheckpointKey, SessionCheckpoint, StoryProgress};

/// Durable key-value store from (task, epic, story) to StoryProgress, plus
/// SDK session checkpoints per (task, agent role, story).
pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    /// Open (or create) the store at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open checkpoint database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory store (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory checkpoint store")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS story_progress (
                task_id TEXT NOT NULL,
                epic_id TEXT NOT NULL,
                story_id TEXT NOT NULL,
                stage TEXT NOT NULL,
                commit_hash TEXT,
                sdk_session_id TEXT,
                files_modified TEXT NOT NULL DEFAULT '[]',
                files_created TEXT NOT NULL DEFAULT '[]',
                tools_used TEXT NOT NULL DEFAULT '[]',
                cost_usd REAL NOT NULL DEFAULT 0,
                verdict TEXT,
                pr_url TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (task_id, epic_id, story_id)
            );

            CREATE TABLE IF NOT EXISTS session_checkpoints (
                task_id TEXT NOT NULL,
                agent_role TEXT NOT NULL,
                story_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                last_message_uuid TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL,
                PRIMARY KEY (task_id, agent_role, story_id)
            );
            ",
        )
        .context("Failed to create checkpoint tables")?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a stage transition. Refuses regressions in the staged order;
    /// re-writing the current stage is allowed (stages are idempotent).
    pub fn save(
        &self,
        key: &CheckpointKey,
        stage: StoryStatus,
        extra: CheckpointExtra,
    ) -> Result<StoryProgress> {
        let existing = self.load(key)?;
        if let Some(ref current) = existing
            && !current.stage.allows_transition_to(stage)
        {
            return Err(PipelineError::StageRegression {
                story_id: key.story_id.clone(),
                from: current.stage.as_str().to_string(),
                to: stage.as_str().to_string(),
            }
            .into());
        }

        let prev = existing.unwrap_or_else(|| StoryProgress::at_stage(StoryStatus::NotStarted));
        let progress = StoryProgress {
            stage,
            commit_hash: extra.commit_hash.or(prev.commit_hash),
            sdk_session_id: extra.sdk_session_id.or(prev.sdk_session_id),
            files_modified: extra.files_modified.unwrap_or(prev.files_modified),
            files_created: extra.files_created.unwrap_or(prev.files_created),
            tools_used: extra.tools_used.unwrap_or(prev.tools_used),
            cost_usd: extra.cost_usd.unwrap_or(prev.cost_usd),
            updated_at: Utc::now(),
        };

        let conn = self.lock();
        conn.execute(
            "INSERT INTO story_progress
                (task_id, epic_id, story_id, stage, commit_hash, sdk_session_id,
                 files_modified, files_created, tools_used, cost_usd, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(task_id, epic_id, story_id) DO UPDATE SET
                stage = excluded.stage,
                commit_hash = excluded.commit_hash,
                sdk_session_id = excluded.sdk_session_id,
                files_modified = excluded.files_modified,
                files_created = excluded.files_created,
                tools_used = excluded.tools_used,
                cost_usd = excluded.cost_usd,
                updated_at = excluded.updated_at",
            params![
                key.task_id,
                key.epic_id,
                key.story_id,
                progress.stage.as_str(),
                progress.commit_hash,
                progress.sdk_session_id,
                serde_json::to_string(&progress.files_modified)?,
                serde_json::to_string(&progress.files_created)?,
                serde_json::to_string(&progress.tools_used)?,
                progress.cost_usd,
                progress.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to save checkpoint")?;
        Ok(progress)
    }

    /// Load the progress record, if any.
    pub fn load(&self, key: &CheckpointKey) -> Result<Option<StoryProgress>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT stage, commit_hash, sdk_session_id, files_modified, files_created,
                    tools_used, cost_usd, updated_at
             FROM story_progress WHERE task_id = ?1 AND epic_id = ?2 AND story_id = ?3",
            params![key.task_id, key.epic_id, key.story_id],
            |row| {
                let stage_str: String = row.get(0)?;
                let files_modified: String = row.get(3)?;
                let files_created: String = row.get(4)?;
                let tools_used: String = row.get(5)?;
                let updated_at: String = row.get(7)?;
                Ok(StoryProgress {
                    stage: StoryStatus::from_str(&stage_str)
                        .unwrap_or(StoryStatus::NotStarted),
                    commit_hash: row.get(1)?,
                    sdk_session_id: row.get(2)?,
                    files_modified: serde_json::from_str(&files_modified).unwrap_or_default(),
                    files_created: serde_json::from_str(&files_created).unwrap_or_default(),
                    tools_used: serde_json::from_str(&tools_used).unwrap_or_default(),
                    cost_usd: row.get(6)?,
                    updated_at: DateTime::parse_from_rfc3339(&updated_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            },
        )
        .optional()
        .context("Failed to load checkpoint")
    }

    /// Mark the story's terminal verdict, recording the preserved branch and
    /// any PR link.
    pub fn mark_completed(
        &self,
        key: &CheckpointKey,
        verdict: StoryStatus,
        branch: &str,
        pr_url: Option<&str>,
    ) -> Result<()> {
        self.save(key, verdict, CheckpointExtra::default())?;
        let conn = self.lock();
        conn.execute(
            "UPDATE story_progress SET verdict = ?4, pr_url = ?5
             WHERE task_id = ?1 AND epic_id = ?2 AND story_id = ?3",
            params![
                key.task_id,
                key.epic_id,
                key.story_id,
                format!("{}:{}", verdict.as_str(), branch),
                pr_url,
            ],
        )
        .context("Failed to mark checkpoint completed")?;
        Ok(())
    }

    /// Persist the SDK session for an agent role on a story.
    pub fn save_session(
        &self,
        task_id: &str,
        agent_role: &str,
        story_id: &str,
        session: &SessionCheckpoint,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO session_checkpoints
                (task_id, agent_role, story_id, session_id, last_message_uuid, metadata, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(task_id, agent_role, story_id) DO UPDATE SET
                session_id = excluded.session_id,
                last_message_uuid = excluded.last_message_uuid,
                metadata = excluded.metadata,
                updated_at = excluded.updated_at",
            params![
                task_id,
                agent_role,
                story_id,
                session.session_id,
                session.last_message_uuid,
                session.metadata.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to save session checkpoint")?;
        Ok(())
    }

    /// Load the SDK session for an agent role on a story, if any.
    pub fn load_session(
        &self,
        task_id: &str,
        agent_role: &str,
        story_id: &str,
    ) -> Result<Option<SessionCheckpoint>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT session_id, last_message_uuid, metadata FROM session_checkpoints
             WHERE task_id = ?1 AND agent_role = ?2 AND story_id = ?3",
            params![task_id, agent_role, story_id],
            |row| {
                let metadata: String = row.get(2)?;
                Ok(SessionCheckpoint {
                    session_id: row.get(0)?,
                    last_message_uuid: row.get(1)?,
                    metadata: serde_json::from_str(&metadata)
                        .unwrap_or(serde_json::Value::Null),
                })
            },
        )
        .optional()
        .context("Failed to load session checkpoint")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CheckpointKey {
        CheckpointKey::new("T1", "E1", "S1")
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let store = CheckpointStore::new_in_memory().unwrap();
        store
            .save(&key(), StoryStatus::CodeGenerating, CheckpointExtra::default())
            .unwrap();
        let progress = store.load(&key()).unwrap().unwrap();
        assert_eq!(progress.stage, StoryStatus::CodeGenerating);
    }

    #[test]
    fn test_load_missing_is_none() {
        let store = CheckpointStore::new_in_memory().unwrap();
        assert!(store.load(&key()).unwrap().is_none());
    }

    #[test]
    fn test_stage_advances_monotonically() {
        let store = CheckpointStore::new_in_memory().unwrap();
        store
            .save(&key(), StoryStatus::CodeWritten, CheckpointExtra::default())
            .unwrap();
        store
            .save(&key(), StoryStatus::Pushed, CheckpointExtra::with_commit("c".repeat(40)))
            .unwrap();

        // Regressing to an earlier stage is refused
        let err = store
            .save(&key(), StoryStatus::CodeGenerating, CheckpointExtra::default())
            .unwrap_err();
        assert!(err.to_string().contains("regression"));

        // Re-writing the current stage is fine (idempotent stages)
        store
            .save(&key(), StoryStatus::Pushed, CheckpointExtra::default())
            .unwrap();
    }

    #[test]
    fn test_extras_merge_with_previous_record() {
        let store = CheckpointStore::new_in_memory().unwrap();
        store
            .save(
                &key(),
                StoryStatus::CodeWritten,
                CheckpointExtra {
                    sdk_session_id: Some("sess-1".into()),
                    cost_usd: Some(0.75),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .save(&key(), StoryStatus::Pushed, CheckpointExtra::with_commit("a".repeat(40)))
            .unwrap();

        let progress = store.load(&key()).unwrap().unwrap();
        assert_eq!(progress.stage, StoryStatus::Pushed);
        // Commit from the new write, session and cost carried forward
        assert_eq!(progress.commit_hash, Some("a".repeat(40)));
        assert_eq!(progress.sdk_session_id.as_deref(), Some("sess-1"));
        assert_eq!(progress.cost_usd, 0.75);
    }

    #[test]
    fn test_terminal_verdicts_always_allowed() {
        let store = CheckpointStore::new_in_memory().unwrap();
        store
            .save(&key(), StoryStatus::JudgeEvaluating, CheckpointExtra::default())
            .unwrap();
        store
            .mark_completed(&key(), StoryStatus::Rejected, "story/S1-001", None)
            .unwrap();
        let progress = store.load(&key()).unwrap().unwrap();
        assert_eq!(progress.stage, StoryStatus::Rejected);
    }

    #[test]
    fn test_checkpoints_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.db");
        {
            let store = CheckpointStore::new(&path).unwrap();
            store
                .save(&key(), StoryStatus::Pushed, CheckpointExtra::with_commit("b".repeat(40)))
                .unwrap();
        }
        let store = CheckpointStore::new(&path).unwrap();
        let progress = store.load(&key()).unwrap().unwrap();
        assert_eq!(progress.stage, StoryStatus::Pushed);
        assert_eq!(progress.commit_hash, Some("b".repeat(40)));
    }

    #[test]
    fn test_session_checkpoint_roundtrip() {
        let store = CheckpointStore::new_in_memory().unwrap();
        assert!(store.load_session("T1", "developer", "S1").unwrap().is_none());

        let session = SessionCheckpoint {
            session_id: "sess-42".into(),
            last_message_uuid: Some("uuid-7".into()),
            metadata: serde_json::json!({"model": "large"}),
        };
        store.save_session("T1", "developer", "S1", &session).unwrap();

        let loaded = store.load_session("T1", "developer", "S1").unwrap().unwrap();
        assert_eq!(loaded.session_id, "sess-42");
        assert_eq!(loaded.last_message_uuid.as_deref(), Some("uuid-7"));
        assert_eq!(loaded.metadata["model"], "large");

        // Upsert replaces
        let session2 = SessionCheckpoint {
            session_id: "sess-43".into(),
            last_message_uuid: None,
            metadata: serde_json::Value::Null,
        };
        store.save_session("T1", "developer", "S1", &session2).unwrap();
        let loaded = store.load_session("T1", "developer", "S1").unwrap().unwrap();
        assert_eq!(loaded.session_id, "sess-43");
    }
}
