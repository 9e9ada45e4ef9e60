use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A top-level unit of work submitted by a human.
///
/// Immutable except through events; terminated when every story reaches a
/// terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub repositories: Vec<Repository>,
    /// Derived list of epic ids, in submission order.
    #[serde(default)]
    pub epic_ids: Vec<String>,
    #[serde(default)]
    pub environment: EnvironmentConfig,
}

impl Task {
    pub fn repository(&self, name: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.name == name)
    }
}

/// A git repository owned by a task for the task's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub clone_url: String,
    pub default_branch: String,
}

/// Per-repository build and verification commands.
///
/// All commands are optional; absent commands skip the corresponding check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoCommands {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typecheck_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lint_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rebuild_cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_cmd: Option<String>,
}

impl RepoCommands {
    /// Whether the rebuild command does real work.
    ///
    /// An `echo ...` rebuild command signals hot module reload and is skipped.
    pub fn has_nontrivial_rebuild(&self) -> bool {
        match &self.rebuild_cmd {
            Some(cmd) => {
                let trimmed = cmd.trim();
                !trimmed.is_empty() && !trimmed.starts_with("echo ") && trimmed != "echo"
            }
            None => false,
        }
    }
}

/// Environment configuration for a task, keyed by repository name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub repos: HashMap<String, RepoCommands>,
}

impl EnvironmentConfig {
    pub fn commands_for(&self, repo_name: &str) -> RepoCommands {
        self.repos.get(repo_name).cloned().unwrap_or_default()
    }
}
