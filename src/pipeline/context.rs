use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::AgentRunner;
use crate::checkpoint::{CheckpointKey, CheckpointStore};
use crate::config::OrchestratorConfig;
use crate::event::{EventLog, EventType, NewEvent};
use crate::git::GitGateway;
use crate::model::{Epic, Story, Task};
use crate::notify::{LogLevel, Notifier};
use crate::sandbox::SandboxGateway;
use crate::workspace::WorkspaceLayout;

/// Everything a story pipeline needs, threaded as a value.
///
/// There is no global mutable state in the orchestrator; concurrent tasks
/// each carry their own context over their own workspace.
#[derive(Clone)]
pub struct PipelineContext {
    pub task: Task,
    pub workspace: WorkspaceLayout,
    pub events: Arc<EventLog>,
    pub checkpoints: Arc<CheckpointStore>,
    pub git: GitGateway,
    pub sandbox: Arc<dyn SandboxGateway>,
    pub runner: Arc<dyn AgentRunner>,
    pub notifier: Arc<dyn Notifier>,
    pub config: OrchestratorConfig,
    pub cancel: CancellationToken,
}

impl PipelineContext {
    /// Working tree path for the epic's repository.
    pub fn repo_path(&self, epic: &Epic) -> PathBuf {
        self.workspace.repo_path(&epic.repository)
    }

    pub fn checkpoint_key(&self, epic: &Epic, story: &Story) -> CheckpointKey {
        CheckpointKey::new(&self.task.id, &epic.id, &story.id)
    }

    /// Append an event (idempotent) and mirror it on the notifier channel.
    pub fn record_event(
        &self,
        event_type: EventType,
        agent: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.events.safe_append(NewEvent::new(
            &self.task.id,
            event_type,
            agent,
            payload.clone(),
        ))?;
        self.notifier.emit(&self.task.id, event_type.as_str(), payload);
        Ok(())
    }

    pub fn console(&self, level: LogLevel, message: &str) {
        self.notifier.console_log(&self.task.id, level, message);
    }
}
