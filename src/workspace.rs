//! Per-task workspace layout.
//!
//! A task owns one directory under the workspace root containing a clone per
//! repository: `<root>/task-<taskId>/<repoName>`. The directory is created at
//! task start and removed at task end; no orchestrator state lives inside it
//! beyond the git working trees themselves.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolves workspace paths for one task.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root: PathBuf,
    task_id: String,
}

impl WorkspaceLayout {
    pub fn new(root: impl Into<PathBuf>, task_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            task_id: task_id.into(),
        }
    }

    /// The task's workspace directory.
    pub fn task_dir(&self) -> PathBuf {
        self.root.join(format!("task-{}", self.task_id))
    }

    /// The working tree for one repository.
    pub fn repo_path(&self, repo_name: &str) -> PathBuf {
        self.task_dir().join(repo_name)
    }

    /// Create the task directory if absent.
    pub fn ensure(&self) -> Result<PathBuf> {
        let dir = self.task_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create workspace at {}", dir.display()))?;
        Ok(dir)
    }

    /// Remove the task directory and everything under it.
    pub fn destroy(&self) -> Result<()> {
        let dir = self.task_dir();
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove workspace at {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout_paths() {
        let layout = WorkspaceLayout::new("/tmp/agent-workspace", "T1");
        assert_eq!(
            layout.task_dir(),
            PathBuf::from("/tmp/agent-workspace/task-T1")
        );
        assert_eq!(
            layout.repo_path("api"),
            PathBuf::from("/tmp/agent-workspace/task-T1/api")
        );
    }

    #[test]
    fn test_ensure_and_destroy() {
        let root = tempdir().unwrap();
        let layout = WorkspaceLayout::new(root.path(), "T2");
        let dir = layout.ensure().unwrap();
        assert!(dir.exists());
        // Idempotent
        layout.ensure().unwrap();
        layout.destroy().unwrap();
        assert!(!dir.exists());
        // Destroy on a missing dir is a no-op
        layout.destroy().unwrap();
    }
}
