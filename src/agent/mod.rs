//! Agent runner interface.
//!
//! The runtime that actually invokes LLMs lives outside this crate; the
//! pipeline depends on this capability set and on nothing else about it.
//! `markers` parses the conventions agents follow in their stdout.

mod cli;
mod markers;

pub use cli::*;
pub use markers::*;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{DeveloperOutput, Epic, RepoCommands, Repository, Story, TokenUsage};

/// Agent roles the pipeline invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Developer,
    Judge,
    ConflictResolver,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Developer => "developer",
            Self::Judge => "judge",
            Self::ConflictResolver => "conflict_resolver",
        }
    }
}

/// Options for resuming a previous SDK session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeOptions {
    pub is_resume: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_at_message: Option<String>,
}

/// Everything a developer invocation needs.
#[derive(Debug, Clone)]
pub struct DeveloperRequest {
    pub task_id: String,
    pub story: Story,
    pub epic: Epic,
    pub repositories: Vec<Repository>,
    pub workspace_path: PathBuf,
    pub story_branch: String,
    pub epic_branch: String,
    pub environment_commands: RepoCommands,
    pub architecture_brief: Option<String>,
    pub feedback: Option<String>,
    pub dev_auth: Option<String>,
    pub sandbox_id: Option<String>,
    pub resume: Option<ResumeOptions>,
}

/// A generic agent invocation (judge, conflict resolver).
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub agent_type: AgentKind,
    pub prompt: String,
    pub workspace_path: PathBuf,
    pub task_id: String,
    /// Human-readable label for progress reporting.
    pub label: String,
    pub session_id: Option<String>,
    pub fork_session: bool,
    pub attachments: Vec<String>,
    pub options: serde_json::Value,
}

/// What a generic agent invocation returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub cost_usd: f64,
    pub usage: TokenUsage,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_uuid: Option<String>,
}

/// External agent invocation capability. Implementations run an LLM with the
/// given role and return cost, usage, and structured output. Every call is a
/// long suspension point (minutes).
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run the developer role for one story.
    async fn execute_developer(&self, request: DeveloperRequest)
    -> anyhow::Result<DeveloperOutput>;

    /// Run any agent role with a prepared prompt.
    async fn execute_agent(&self, request: AgentRequest) -> anyhow::Result<AgentOutcome>;
}
