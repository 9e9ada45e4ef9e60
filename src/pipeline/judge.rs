//! Stage C: the judge evaluates the validated commit.

use crate::agent::{AgentKind, AgentRequest, parse_build_signals, parse_judge_verdict};
use crate::checkpoint::CheckpointExtra;
use crate::errors::PipelineError;
use crate::model::{
    BuildCheckOutcome, Epic, JudgeInput, JudgeResult, JudgeStageResult, Story, StoryStatus,
};
use crate::notify::LogLevel;
use crate::sandbox::BUILD_EXEC_TIMEOUT;

use super::context::PipelineContext;

/// Run the judge stage against a specific commit on the story branch.
pub async fn run_judge_stage(
    ctx: &PipelineContext,
    story: &Story,
    epic: &Epic,
    commit_sha: &str,
    files_modified: Vec<String>,
    files_created: Vec<String>,
    iteration: u32,
) -> Result<JudgeStageResult, PipelineError> {
    let key = ctx.checkpoint_key(epic, story);
    let repo_path = ctx.repo_path(epic);

    // Sync the workspace to exactly what was pushed.
    if let Err(e) = ctx.git.fetch(&repo_path).await {
        tracing::warn!(error = %e, "judge-stage fetch failed, evaluating local state");
    }
    ctx.git
        .checkout(&repo_path, &story.branch_name, Some(&epic.branch_name))
        .await?;
    let remote_ref = format!("origin/{}", story.branch_name);
    if let Err(e) = ctx.git.reset_hard(&repo_path, &remote_ref).await {
        // A branch that only exists locally still gets judged.
        tracing::debug!(error = %e, "reset to remote ref failed, judging local tip");
    }

    ctx.checkpoints.save(
        &key,
        StoryStatus::JudgeEvaluating,
        CheckpointExtra::with_commit(commit_sha),
    )?;

    let build_check = run_build_verification(ctx, epic).await;

    let input = JudgeInput {
        task_id: ctx.task.id.clone(),
        story_id: story.id.clone(),
        story_title: story.title.clone(),
        commit_sha: commit_sha.to_string(),
        branch_name: story.branch_name.clone(),
        workspace_path: repo_path.display().to_string(),
        acceptance_criteria: story.acceptance_criteria.clone(),
        files_modified,
        files_created,
        build_check,
    };

    let prompt = judge_prompt(&input)?;
    let outcome = ctx
        .runner
        .execute_agent(AgentRequest {
            agent_type: AgentKind::Judge,
            prompt,
            workspace_path: repo_path,
            task_id: ctx.task.id.clone(),
            label: format!("judge:{}", story.id),
            session_id: None,
            fork_session: false,
            attachments: Vec::new(),
            options: serde_json::Value::Null,
        })
        .await
        .map_err(|e| PipelineError::AgentFailed {
            stage: "judge".into(),
            message: format!("{:#}", e),
        })?;

    let Some(verdict) = parse_judge_verdict(&outcome.output) else {
        return Err(PipelineError::AgentFailed {
            stage: "judge".into(),
            message: "judge returned no parseable verdict".into(),
        });
    };

    ctx.console(
        LogLevel::Info,
        &format!(
            "judge {} story {} ({})",
            if verdict.approved { "approved" } else { "rejected" },
            story.id,
            commit_sha,
        ),
    );

    Ok(JudgeStageResult {
        result: JudgeResult {
            approved: verdict.approved,
            score: verdict.score,
            feedback: verdict.feedback,
            reject_reason: verdict.reject_reason,
            cost_usd: outcome.cost_usd,
            tokens: outcome.usage,
        },
        iteration,
        max_retries: 1,
    })
}

/// Run the environment's verification commands in the sandbox. Failures are
/// recorded for the judge's context but never block it.
async fn run_build_verification(ctx: &PipelineContext, epic: &Epic) -> Option<BuildCheckOutcome> {
    let commands = ctx.task.environment.commands_for(&epic.repository);
    let repo_path = ctx.repo_path(epic);

    let checks: [(&Option<String>, &str); 4] = [
        (&commands.typecheck_cmd, "typecheck"),
        (&commands.test_cmd, "test"),
        (&commands.lint_cmd, "lint"),
        (&commands.build_cmd, "build"),
    ];
    if checks.iter().all(|(cmd, _)| cmd.is_none()) {
        return None;
    }

    let mut outcome = BuildCheckOutcome::default();
    for (cmd, name) in checks {
        let Some(cmd) = cmd else { continue };
        let passed = match ctx
            .sandbox
            .exec(&ctx.task.id, cmd, &repo_path, BUILD_EXEC_TIMEOUT)
            .await
        {
            Ok(exec) => {
                // Explicit signal markers in the output override the exit code.
                let signals = parse_build_signals(&exec.stdout);
                let signal = match name {
                    "typecheck" => signals.typecheck,
                    "test" => signals.tests,
                    "lint" => signals.lint,
                    _ => signals.build,
                };
                signal.unwrap_or(exec.success())
            }
            Err(e) => {
                tracing::warn!(check = name, error = %e, "build verification command failed to run");
                false
            }
        };
        match name {
            "typecheck" => outcome.typecheck_passed = Some(passed),
            "test" => outcome.tests_passed = Some(passed),
            "lint" => outcome.lint_passed = Some(passed),
            _ => outcome.build_passed = Some(passed),
        }
        if !passed {
            ctx.console(
                LogLevel::Warn,
                &format!("{} check failed before judge (non-blocking)", name),
            );
        }
    }
    Some(outcome)
}

fn judge_prompt(input: &JudgeInput) -> Result<String, PipelineError> {
    let payload = serde_json::to_string_pretty(input).map_err(|e| PipelineError::Other(e.into()))?;
    Ok(format!(
        "Evaluate commit {} on branch {} against the story's acceptance criteria.\n\
         Respond with a JSON object: {{\"approved\": bool, \"score\": number, \
         \"feedback\": string, \"reject_reason\": one of \
         [\"conflicts\",\"code_issues\",\"scope_violation\",\"placeholder_code\",\"missing_files\",\"other\"]}}.\n\n\
         {}",
        input.commit_sha, input.branch_name, payload
    ))
}
