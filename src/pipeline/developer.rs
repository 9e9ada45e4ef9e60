//! Stage A: the developer writes code on the story branch.

use serde_json::json;

use crate::agent::{AgentKind, DeveloperRequest, ResumeOptions};
use crate::checkpoint::{CheckpointExtra, SessionCheckpoint};
use crate::errors::PipelineError;
use crate::event::EventType;
use crate::model::{DeveloperStageResult, Epic, Story, StoryStatus};
use crate::notify::LogLevel;

use super::context::PipelineContext;

/// Run the developer stage.
///
/// Pre-condition: the epic branch exists locally and on the remote. The
/// story branch is created from the epic branch head when it does not exist
/// yet, so story N sees stories 1..N-1's merged work.
pub async fn run_developer_stage(
    ctx: &PipelineContext,
    story: &Story,
    epic: &Epic,
) -> Result<DeveloperStageResult, PipelineError> {
    let key = ctx.checkpoint_key(epic, story);
    let repo_path = ctx.repo_path(epic);

    ctx.checkpoints
        .save(&key, StoryStatus::CodeGenerating, CheckpointExtra::default())?;

    // Branch setup: prefer local, then remote tracking, then create from the
    // epic branch head.
    if let Err(e) = ctx.git.fetch(&repo_path).await {
        tracing::warn!(error = %e, "pre-developer fetch failed, continuing with local refs");
    }
    ctx.git
        .checkout(&repo_path, &story.branch_name, Some(&epic.branch_name))
        .await?;

    // Rollback point, should a human want to revert this story wholesale.
    let rollback_sha = ctx.git.head_sha(&repo_path).await?;
    tracing::debug!(story_id = %story.id, %rollback_sha, "developer stage starting");

    // Resume a previous SDK session when one is checkpointed.
    let resume = ctx
        .checkpoints
        .load_session(&ctx.task.id, AgentKind::Developer.as_str(), &story.id)?
        .map(|session| ResumeOptions {
            is_resume: true,
            resume_session_id: Some(session.session_id),
            resume_at_message: session.last_message_uuid,
        });

    ctx.record_event(
        EventType::DeveloperStarted,
        AgentKind::Developer.as_str(),
        json!({
            "story_id": story.id,
            "epic_id": epic.id,
            "branch_name": story.branch_name,
            "resume": resume.as_ref().map(|r| r.is_resume).unwrap_or(false),
        }),
    )?;
    ctx.console(
        LogLevel::Info,
        &format!("developer starting on {} ({})", story.id, story.branch_name),
    );

    let sandbox_id = ctx
        .sandbox
        .sandbox(&ctx.task.id)
        .await
        .map(|d| d.sandbox_id);

    let request = DeveloperRequest {
        task_id: ctx.task.id.clone(),
        story: story.clone(),
        epic: epic.clone(),
        repositories: ctx.task.repositories.clone(),
        workspace_path: ctx.workspace.task_dir(),
        story_branch: story.branch_name.clone(),
        epic_branch: epic.branch_name.clone(),
        environment_commands: ctx.task.environment.commands_for(&epic.repository),
        architecture_brief: None,
        feedback: None,
        dev_auth: None,
        sandbox_id,
        resume,
    };

    let output = ctx
        .runner
        .execute_developer(request)
        .await
        .map_err(|e| PipelineError::AgentFailed {
            stage: "developer".into(),
            message: format!("{:#}", e),
        })?;

    // Persist the session so a restart can resume the conversation.
    if let Some(session_id) = &output.sdk_session_id {
        ctx.checkpoints.save_session(
            &ctx.task.id,
            AgentKind::Developer.as_str(),
            &story.id,
            &SessionCheckpoint {
                session_id: session_id.clone(),
                last_message_uuid: None,
                metadata: serde_json::Value::Null,
            },
        )?;
    }

    ctx.checkpoints.save(
        &key,
        StoryStatus::CodeWritten,
        CheckpointExtra {
            sdk_session_id: output.sdk_session_id.clone(),
            files_modified: Some(output.files_modified.clone()),
            files_created: Some(output.files_created.clone()),
            tools_used: Some(output.tools_used.clone()),
            cost_usd: Some(output.cost_usd),
            ..Default::default()
        },
    )?;

    Ok(DeveloperStageResult {
        output,
        skipped: false,
        error: None,
    })
}
