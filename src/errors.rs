//! Typed error hierarchy for the Foreman orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `GitError` — git gateway and workspace inspection failures
//! - `PipelineError` — per-story stage failures
//! - `CoordinatorError` — task-level coordination failures

use thiserror::Error;

/// Errors from the git gateway.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to spawn git process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("git {operation} failed in {repo_path}: {stderr}")]
    CommandFailed {
        operation: String,
        repo_path: std::path::PathBuf,
        stderr: String,
    },

    #[error("git {operation} timed out after {timeout_secs}s")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("git {operation} still failing after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Branch {branch} not found in {repo_path}")]
    BranchNotFound {
        branch: String,
        repo_path: std::path::PathBuf,
    },

    #[error("Repository error: {0}")]
    Repository(#[from] git2::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single story pipeline execution.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Developer produced no commit and no salvageable work for story {story_id}")]
    NoWorkProduced { story_id: String },

    #[error("Agent invocation failed in {stage} stage: {message}")]
    AgentFailed { stage: String, message: String },

    #[error("Merge of {source_branch} into {target} conflicted in {files:?}")]
    MergeConflict {
        source_branch: String,
        target: String,
        files: Vec<String>,
    },

    #[error("Checkpoint stage regression: {from} -> {to} for story {story_id}")]
    StageRegression {
        story_id: String,
        from: String,
        to: String,
    },

    #[error("Pipeline cancelled during {stage} stage")]
    Cancelled { stage: String },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the epic coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Epic dependency cycle involving {epic_id}")]
    DependencyCycle { epic_id: String },

    #[error("Story {story_id} references unknown epic {epic_id}")]
    UnknownEpic { story_id: String, epic_id: String },

    #[error("Epic {epic_id} depends on unknown epic {dependency}")]
    UnknownDependency { epic_id: String, dependency: String },

    #[error("Task {task_id} has no epics to execute")]
    NoEpics { task_id: String },

    #[error("Task {task_id} exceeded cost ceiling: spent ${spent:.2} of ${ceiling:.2}")]
    CostCeilingExceeded {
        task_id: String,
        spent: f64,
        ceiling: f64,
    },

    #[error("Event log error: {0}")]
    EventLog(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn git_error_spawn_failed_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "git not found");
        let err = GitError::SpawnFailed(io_err);
        match &err {
            GitError::SpawnFailed(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            _ => panic!("Expected SpawnFailed variant"),
        }
    }

    #[test]
    fn git_error_command_failed_carries_context() {
        let err = GitError::CommandFailed {
            operation: "push".to_string(),
            repo_path: std::path::PathBuf::from("/work/task-1/api"),
            stderr: "remote hung up".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("push"));
        assert!(msg.contains("remote hung up"));
    }

    #[test]
    fn pipeline_error_merge_conflict_lists_files() {
        let err = PipelineError::MergeConflict {
            source_branch: "story/S1-002".to_string(),
            target: "epic/auth".to_string(),
            files: vec!["README.md".to_string()],
        };
        assert!(err.to_string().contains("README.md"));
    }

    #[test]
    fn pipeline_error_converts_from_git_error() {
        let inner = GitError::BranchNotFound {
            branch: "story/S1-001".to_string(),
            repo_path: std::path::PathBuf::from("/work"),
        };
        let pipeline_err: PipelineError = inner.into();
        assert!(matches!(
            pipeline_err,
            PipelineError::Git(GitError::BranchNotFound { .. })
        ));
    }

    #[test]
    fn coordinator_error_cost_ceiling_formats_amounts() {
        let err = CoordinatorError::CostCeilingExceeded {
            task_id: "T1".to_string(),
            spent: 12.5,
            ceiling: 10.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("$12.50"));
        assert!(msg.contains("$10.00"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&GitError::Timeout {
            operation: "fetch".into(),
            timeout_secs: 90,
        });
        assert_std_error(&PipelineError::NoWorkProduced {
            story_id: "S1".into(),
        });
        assert_std_error(&CoordinatorError::NoEpics { task_id: "T1".into() });
    }
}
