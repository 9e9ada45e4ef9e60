//! Agent runner backed by the Claude CLI.
//!
//! The production deployment injects an SDK-backed runner with streaming
//! and cost accounting; this implementation shells out to the `claude`
//! binary so the orchestrator runs end-to-end from the command line. Cost
//! and token figures are zero here because the CLI does not report them.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;

use crate::model::{DeveloperOutput, TokenUsage};

use super::{
    AgentOutcome, AgentRequest, AgentRunner, DeveloperRequest, developer_finished,
    extract_commit_sha,
};

/// Default cap for one agent invocation (30 minutes).
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 1800;

/// Invokes agents through the Claude CLI.
pub struct CliAgentRunner {
    claude_cmd: String,
    timeout: Duration,
}

impl CliAgentRunner {
    pub fn new() -> Self {
        Self {
            claude_cmd: std::env::var("CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string()),
            timeout: Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_prompt(&self, prompt: &str, cwd: &std::path::Path) -> Result<String> {
        let mut cmd = Command::new(&self.claude_cmd);
        cmd.arg("--print")
            .arg("--dangerously-skip-permissions")
            .arg(prompt)
            .env_remove("CLAUDECODE")
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| format!("agent invocation timed out after {:?}", self.timeout))?
            .context("Failed to spawn agent process")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("agent process exited non-zero: {}", stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for CliAgentRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRunner for CliAgentRunner {
    async fn execute_developer(&self, request: DeveloperRequest) -> Result<DeveloperOutput> {
        let criteria = if request.story.acceptance_criteria.is_empty() {
            String::new()
        } else {
            format!(
                "\nAcceptance criteria:\n- {}",
                request.story.acceptance_criteria.join("\n- ")
            )
        };
        let prompt = format!(
            "You are the developer for story \"{}\" on branch {} (epic branch {}).\n\
             Implement the story, commit your work on the story branch, and push it.\n\
             When finished print ✅ DEVELOPER_FINISHED_SUCCESSFULLY and 📍 Commit SHA: <sha>.\n\
             If you cannot finish, print ❌ FAILED.{}",
            request.story.title, request.story_branch, request.epic_branch, criteria,
        );

        let cwd = request.workspace_path.join(&request.epic.repository);
        let output = self.run_prompt(&prompt, &cwd).await?;

        Ok(DeveloperOutput {
            success: developer_finished(&output),
            commit_sha: extract_commit_sha(&output).unwrap_or_default(),
            branch_name: request.story_branch,
            files_modified: Vec::new(),
            files_created: Vec::new(),
            tools_used: Vec::new(),
            cost_usd: 0.0,
            tokens: TokenUsage::default(),
            completed_at: Utc::now(),
            story_id: request.story.id,
            raw_response: Some(output),
            sdk_session_id: None,
        })
    }

    async fn execute_agent(&self, request: AgentRequest) -> Result<AgentOutcome> {
        let output = self
            .run_prompt(&request.prompt, &request.workspace_path)
            .await?;
        Ok(AgentOutcome {
            cost_usd: 0.0,
            usage: TokenUsage::default(),
            output,
            sdk_session_id: None,
            last_message_uuid: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_prompt_with_stub_command() {
        // `echo` stands in for the CLI: it prints the prompt back.
        let runner = CliAgentRunner {
            claude_cmd: "echo".to_string(),
            timeout: Duration::from_secs(5),
        };
        let output = runner
            .run_prompt("✅ APPROVED", std::path::Path::new("."))
            .await
            .unwrap();
        assert!(output.contains("APPROVED"));
    }

    #[tokio::test]
    async fn test_run_prompt_nonzero_exit_is_error() {
        let runner = CliAgentRunner {
            claude_cmd: "false".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(
            runner
                .run_prompt("anything", std::path::Path::new("."))
                .await
                .is_err()
        );
    }
}
