//! Stage D: merge the approved story branch into the epic branch.
//!
//! Conflicts go through two lines of defense (mechanical union, then the AI
//! conflict resolver); a merge that survives both markered is aborted and
//! the story parks in the merge-conflict state for a human.

use std::path::Path;

use crate::agent::{AgentKind, AgentRequest, parse_conflict_verdict};
use crate::checkpoint::CheckpointExtra;
use crate::errors::PipelineError;
use crate::model::{Epic, MergeStageResult, Story, StoryStatus, TokenUsage};
use crate::notify::LogLevel;
use crate::sandbox::BUILD_EXEC_TIMEOUT;

use super::conflict::{has_conflict_markers, is_dependency_manifest, resolve_by_union};
use super::context::PipelineContext;

/// Outcome of resolving markered files in the working tree.
pub(super) struct ResolutionOutcome {
    pub resolved: bool,
    /// True when the mechanical union handled every file.
    pub auto_resolved: bool,
    pub ai_cost: f64,
    pub ai_usage: TokenUsage,
    /// The resolver's own `CONFLICT_UNRESOLVABLE` explanation, when it gave one.
    pub unresolvable_reason: Option<String>,
}

/// Run the merge stage. Only called once the judge has approved.
pub async fn run_merge_stage(
    ctx: &PipelineContext,
    story: &Story,
    epic: &Epic,
) -> Result<MergeStageResult, PipelineError> {
    let key = ctx.checkpoint_key(epic, story);
    let repo_path = ctx.repo_path(epic);
    let message = format!("Merge story: {}", story.title);

    let merge = ctx
        .git
        .merge(&repo_path, &story.branch_name, &epic.branch_name, &message)
        .await?;

    let mut result = MergeStageResult::default();

    if merge.ok {
        ctx.git
            .push(&repo_path, &epic.branch_name, Default::default())
            .await?;
        result.merged = true;
        result.merge_commit_sha = merge.merge_commit_sha;
    } else {
        ctx.console(
            LogLevel::Warn,
            &format!(
                "merge of {} conflicted in {:?}",
                story.branch_name, merge.conflicted_files
            ),
        );
        let resolution = resolve_markered_files(
            ctx,
            epic,
            &repo_path,
            &merge.conflicted_files,
            &format!("Merge story: {} (auto-resolved conflicts)", story.title),
        )
        .await?;

        result.conflicted_files = merge.conflicted_files.clone();
        result.conflict_resolution_cost = resolution.ai_cost;
        result.conflict_resolution_usage = resolution.ai_usage;

        if !resolution.resolved {
            ctx.console(
                LogLevel::Warn,
                &format!(
                    "conflict resolution failed for {}: {}",
                    story.branch_name,
                    resolution
                        .unresolvable_reason
                        .as_deref()
                        .unwrap_or("markers remain after both resolution passes"),
                ),
            );
            ctx.git.abort_merge(&repo_path).await?;
            result.merge_conflict = true;
            result.conflict_unresolvable_reason = resolution.unresolvable_reason;
            return Ok(result);
        }

        ctx.git
            .push(&repo_path, &epic.branch_name, Default::default())
            .await?;
        result.merged = true;
        result.conflict_auto_resolved = resolution.auto_resolved;
        result.merge_commit_sha = Some(ctx.git.head_sha(&repo_path).await?);
    }

    ctx.checkpoints
        .save(&key, StoryStatus::MergedToEpic, CheckpointExtra::default())?;

    trigger_rebuild(ctx, epic).await;

    // Branch cleanup is best-effort; a leftover branch is not a failure.
    if let Err(e) = ctx
        .git
        .delete_branch(&repo_path, &story.branch_name, true)
        .await
    {
        tracing::warn!(branch = %story.branch_name, error = %e, "story branch cleanup failed");
    }

    Ok(result)
}

/// Resolve conflict markers in the listed files: mechanical union first, AI
/// resolver second. On success the files are staged, committed and left on
/// the current branch (the open merge commit, in the merge path).
pub(super) async fn resolve_markered_files(
    ctx: &PipelineContext,
    epic: &Epic,
    repo_path: &Path,
    files: &[String],
    commit_message: &str,
) -> Result<ResolutionOutcome, PipelineError> {
    let mut outcome = ResolutionOutcome {
        resolved: false,
        auto_resolved: true,
        ai_cost: 0.0,
        ai_usage: TokenUsage::default(),
        unresolvable_reason: None,
    };
    if files.is_empty() {
        return Ok(outcome);
    }

    // Pass 1: mechanical union of both sides, file by file.
    let mut remaining: Vec<String> = Vec::new();
    for file in files {
        let path = repo_path.join(file);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| PipelineError::Other(e.into()))?;
        match resolve_by_union(&content) {
            Some(resolved) if !has_conflict_markers(&resolved) => {
                tokio::fs::write(&path, resolved)
                    .await
                    .map_err(|e| PipelineError::Other(e.into()))?;
            }
            _ => remaining.push(file.clone()),
        }
    }

    // Pass 2: the specialist, fed the still-markered content.
    if !remaining.is_empty() {
        outcome.auto_resolved = false;
        let mut sections = Vec::new();
        for file in &remaining {
            let content = tokio::fs::read_to_string(repo_path.join(file))
                .await
                .map_err(|e| PipelineError::Other(e.into()))?;
            sections.push(format!("=== {} ===\n{}", file, content));
        }
        let prompt = format!(
            "Resolve the git conflict markers in the files below, editing them in place. \
             Keep the intent of both sides. When done print ✅ CONFLICT_RESOLVED, or \
             ❌ CONFLICT_UNRESOLVABLE: <reason> if the changes cannot be reconciled.\n\n{}",
            sections.join("\n\n")
        );
        let agent = ctx
            .runner
            .execute_agent(AgentRequest {
                agent_type: AgentKind::ConflictResolver,
                prompt,
                workspace_path: repo_path.to_path_buf(),
                task_id: ctx.task.id.clone(),
                label: format!("conflict-resolver:{}", epic.id),
                session_id: None,
                fork_session: false,
                attachments: remaining.clone(),
                options: serde_json::Value::Null,
            })
            .await
            .map_err(|e| PipelineError::AgentFailed {
                stage: "conflict_resolver".into(),
                message: format!("{:#}", e),
            })?;
        outcome.ai_cost = agent.cost_usd;
        outcome.ai_usage = agent.usage;

        // The resolver's verdict is a hint like any other agent output, but
        // its unresolvable reason is the only explanation we will ever get.
        let verdict = parse_conflict_verdict(&agent.output);
        if let Some(v) = &verdict
            && !v.resolved
        {
            outcome.unresolvable_reason = v.reason.clone();
        }

        // Trust nothing: verify every file on disk is marker-free.
        for file in files {
            let content = tokio::fs::read_to_string(repo_path.join(file))
                .await
                .map_err(|e| PipelineError::Other(e.into()))?;
            if has_conflict_markers(&content) {
                if verdict.as_ref().map(|v| v.resolved).unwrap_or(false) {
                    tracing::warn!(
                        file = %file,
                        "resolver reported CONFLICT_RESOLVED but markers remain"
                    );
                }
                return Ok(outcome);
            }
        }
    }

    ctx.git.commit_all(repo_path, commit_message).await?;
    outcome.resolved = true;

    // A conflicted dependency manifest means the lockfile state is suspect;
    // reinstall in the sandbox.
    if files.iter().any(|f| is_dependency_manifest(f))
        && let Some(install) = ctx
            .task
            .environment
            .commands_for(&epic.repository)
            .install_cmd
    {
        match ctx
            .sandbox
            .exec(&ctx.task.id, &install, repo_path, BUILD_EXEC_TIMEOUT)
            .await
        {
            Ok(exec) if !exec.success() => ctx.console(
                LogLevel::Warn,
                &format!("dependency reinstall exited {}", exec.exit_code),
            ),
            Err(e) => ctx.console(
                LogLevel::Warn,
                &format!("dependency reinstall failed to run: {:#}", e),
            ),
            _ => {}
        }
    }

    Ok(outcome)
}

/// Rebuild the repository in the sandbox after a merge, when the environment
/// defines a real rebuild command. An `echo` command signals hot reload and
/// is skipped. Failures are reported but never fail the story.
async fn trigger_rebuild(ctx: &PipelineContext, epic: &Epic) {
    let commands = ctx.task.environment.commands_for(&epic.repository);
    if !commands.has_nontrivial_rebuild() {
        return;
    }
    let Some(rebuild) = commands.rebuild_cmd else {
        return;
    };
    let repo_path = ctx.repo_path(epic);
    match ctx
        .sandbox
        .exec(&ctx.task.id, &rebuild, &repo_path, BUILD_EXEC_TIMEOUT)
        .await
    {
        Ok(exec) if !exec.success() => ctx.console(
            LogLevel::Warn,
            &format!("post-merge rebuild exited {}", exec.exit_code),
        ),
        Err(e) => ctx.console(
            LogLevel::Warn,
            &format!("post-merge rebuild failed to run: {:#}", e),
        ),
        _ => {}
    }
}
