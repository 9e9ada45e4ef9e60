//! Stage B: determine the exact commit representing the developer's work.
//!
//! Git is the source of truth. The developer's textual claims (markers,
//! reported SHA) are consulted only after the object graph has nothing to
//! offer.

use std::time::Duration;

use crate::agent::{developer_failed, developer_finished, extract_commit_sha};
use crate::checkpoint::CheckpointExtra;
use crate::errors::PipelineError;
use crate::event::spawn_verify_story_push;
use crate::git;
use crate::model::{DeveloperOutput, Epic, GitValidationStageResult, Story, StoryStatus};
use crate::notify::LogLevel;

use super::context::PipelineContext;

/// Grace period for push propagation before the first remote check.
const PUSH_PROPAGATION_DELAY: Duration = Duration::from_secs(3);

/// Run the git validation stage.
pub async fn run_validation_stage(
    ctx: &PipelineContext,
    story: &Story,
    epic: &Epic,
    developer: &DeveloperOutput,
) -> Result<GitValidationStageResult, PipelineError> {
    let key = ctx.checkpoint_key(epic, story);
    let repo_path = ctx.repo_path(epic);

    tokio::time::sleep(PUSH_PROPAGATION_DELAY).await;

    // The event log holds the definitive branch name for the story; an agent
    // restart may have renamed what the in-memory story carries.
    let snapshot = ctx
        .events
        .current_state(&ctx.task.id)
        .map_err(PipelineError::Other)?;
    let branch = snapshot
        .story_branch(&story.id)
        .filter(|b| !b.is_empty())
        .unwrap_or(&story.branch_name)
        .to_string();

    if let Err(e) = ctx.git.fetch(&repo_path).await {
        tracing::warn!(error = %e, "validation fetch failed, inspecting local state");
    }
    let work = git::verify_developer_work(&repo_path, &branch, Some(&epic.branch_name))
        .map_err(PipelineError::Other)?;

    // An explicit FAILED marker with no work in git is a real failure; with
    // work present, git wins and the marker is ignored.
    let raw = developer.raw_response.as_deref().unwrap_or("");
    if developer_failed(raw) && !work.has_commits {
        let detection =
            git::detect_work_in_workspace(&repo_path).map_err(PipelineError::Other)?;
        if !detection.has_any_work() {
            return Ok(GitValidationStageResult::failure(
                &branch,
                "developer reported FAILED and git shows no work",
            ));
        }
    }

    if let Some(sha) = work.commit_sha.filter(|_| work.has_commits) {
        ctx.git
            .ensure_commit_on_remote(&repo_path, &branch, &sha)
            .await?;
        ctx.checkpoints
            .save(&key, StoryStatus::Pushed, CheckpointExtra::with_commit(&sha))?;
        spawn_verify_story_push(
            ctx.task.id.clone(),
            story.id.clone(),
            branch.clone(),
            repo_path.clone(),
            ctx.notifier.clone(),
        );
        ctx.console(
            LogLevel::Info,
            &format!("validated {} commits on {}, tip {}", work.commit_count, branch, sha),
        );
        return Ok(GitValidationStageResult {
            commit_sha: Some(sha),
            branch_name: branch,
            salvaged: false,
            from_markers: false,
            failed: false,
            error: None,
        });
    }

    // No commits: try the auto-commit safety net on whatever is in the tree.
    if let Some(sha) = ctx
        .git
        .auto_commit_uncommitted_work(&repo_path, &story.title, &branch)
        .await?
    {
        ctx.checkpoints
            .save(&key, StoryStatus::Pushed, CheckpointExtra::with_commit(&sha))?;
        ctx.console(
            LogLevel::Warn,
            &format!("auto-committed uncommitted work on {} as {}", branch, sha),
        );
        return Ok(GitValidationStageResult {
            commit_sha: Some(sha),
            branch_name: branch,
            salvaged: true,
            from_markers: false,
            failed: false,
            error: None,
        });
    }

    // Last resort: believe the output markers, but only a well-formed pair.
    if developer_finished(raw)
        && let Some(sha) = extract_commit_sha(raw)
    {
        ctx.console(
            LogLevel::Warn,
            &format!("accepting marker-reported commit {} for {}", sha, story.id),
        );
        ctx.checkpoints
            .save(&key, StoryStatus::Pushed, CheckpointExtra::with_commit(&sha))?;
        return Ok(GitValidationStageResult {
            commit_sha: Some(sha),
            branch_name: branch,
            salvaged: false,
            from_markers: true,
            failed: false,
            error: None,
        });
    }

    Ok(GitValidationStageResult::failure(
        &branch,
        "no commits on branch, nothing to auto-commit, no trustworthy markers",
    ))
}
