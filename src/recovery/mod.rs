//! Recovery from stage failures.
//!
//! When a stage errors, the recovery service gathers git evidence, consults
//! the failure classifier, and either salvages the existing work straight to
//! the judge, asks the caller to retry the pipeline (checkpoints make
//! re-entry land on the failed stage), or settles the story as a terminal
//! failure. Recovery never recovers from itself: an error inside this
//! module is logged and settled as a zero-result failure.

use serde_json::json;

use crate::checkpoint::CheckpointExtra;
use crate::event::EventType;
use crate::failure::{FailureContext, classify};
use crate::git::{self, PushOpts};
use crate::model::{
    Epic, MergeStageResult, Story, StoryPipelineResult, StoryStatus,
};
use crate::notify::LogLevel;
use crate::pipeline::{PipelineContext, StageFailure, StoryPipeline, run_judge_stage, run_merge_stage};

/// What the coordinator should do after a recovery pass.
#[derive(Debug)]
pub enum RecoveryVerdict {
    /// Sleep for the given delay and re-enter the pipeline; the checkpoint
    /// store resumes it at the failed stage.
    Retry { delay_ms: u64 },
    /// The story's outcome is decided; stop.
    Settled(Box<StoryPipelineResult>),
}

pub struct RecoveryService;

impl RecoveryService {
    /// Attempt recovery for a failed stage. Never errors.
    pub async fn recover(
        ctx: &PipelineContext,
        story: &Story,
        epic: &Epic,
        failure: StageFailure,
        retries_attempted: u32,
    ) -> RecoveryVerdict {
        match Self::try_recover(ctx, story, epic, &failure, retries_attempted).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::error!(
                    story_id = %story.id,
                    error = %format!("{:#}", e),
                    "recovery itself failed; settling story as failed"
                );
                let mut result =
                    StoryPipelineResult::failed(&story.id, &story.branch_name, failure.error.to_string());
                result.costs = failure.costs;
                result.usage = failure.usage;
                result.failure_category = Some("UNKNOWN".into());
                RecoveryVerdict::Settled(Box::new(result))
            }
        }
    }

    async fn try_recover(
        ctx: &PipelineContext,
        story: &Story,
        epic: &Epic,
        failure: &StageFailure,
        retries_attempted: u32,
    ) -> anyhow::Result<RecoveryVerdict> {
        let repo_path = ctx.repo_path(epic);

        // Evidence: what does git actually say?
        let detection = git::detect_work_in_workspace(&repo_path).unwrap_or_default();
        let work =
            git::verify_developer_work(&repo_path, &story.branch_name, Some(&epic.branch_name))
                .unwrap_or_default();

        let context = FailureContext {
            error: failure.error.to_string(),
            retries_attempted,
            developer_output: failure.developer_output.clone(),
            workspace_detection: Some(detection.clone()),
            has_commits_on_branch: Some(work.has_commits),
            elapsed_ms: None,
            timeout_ms: None,
            phase: failure.stage.to_string(),
            judge_rejected: false,
        };
        let analysis = classify(&context, &ctx.config.retry);

        ctx.notifier.emit(
            &ctx.task.id,
            "failure_analysis",
            serde_json::to_value(&analysis)?,
        );
        ctx.console(
            LogLevel::Warn,
            &format!(
                "stage {} failed for {}: category {}, strategy {:?}",
                failure.stage,
                story.id,
                analysis.category.as_str(),
                analysis.strategy,
            ),
        );

        if analysis.should_call_judge {
            return Self::salvage_to_judge(ctx, story, epic, failure, &analysis, &detection, &work)
                .await;
        }

        if analysis.should_retry {
            return Ok(RecoveryVerdict::Retry {
                delay_ms: analysis.retry_delay_ms,
            });
        }

        // Terminal: record the failure and stop.
        let key = ctx.checkpoint_key(epic, story);
        ctx.checkpoints
            .mark_completed(&key, StoryStatus::Failed, &story.branch_name, None)?;
        ctx.record_event(
            EventType::StoryFailed,
            "recovery",
            json!({
                "story_id": story.id,
                "epic_id": epic.id,
                "status": "failed",
                "category": analysis.category.as_str(),
                "is_terminal": true,
                "evidence": analysis.evidence,
                "recommendations": analysis.recommendations,
                "error": failure.error.to_string(),
            }),
        )?;
        let mut result =
            StoryPipelineResult::failed(&story.id, &story.branch_name, failure.error.to_string());
        result.costs = failure.costs;
        result.usage = failure.usage;
        result.failure_category = Some(analysis.category.as_str().to_string());
        Ok(RecoveryVerdict::Settled(Box::new(result)))
    }

    /// Salvage path: commit whatever exists, then judge and merge it.
    async fn salvage_to_judge(
        ctx: &PipelineContext,
        story: &Story,
        epic: &Epic,
        failure: &StageFailure,
        analysis: &crate::failure::FailureAnalysis,
        detection: &git::WorkspaceDetection,
        work: &git::DeveloperWork,
    ) -> anyhow::Result<RecoveryVerdict> {
        let repo_path = ctx.repo_path(epic);
        let mut costs = failure.costs;
        let mut usage = failure.usage;

        // Uncommitted work gets committed first; otherwise the branch's own
        // commits are the salvage target.
        let commit_sha = if detection.has_any_work() {
            ctx.git
                .checkout(&repo_path, &story.branch_name, Some(&epic.branch_name))
                .await?;
            ctx.git
                .auto_commit_uncommitted_work(&repo_path, &story.title, &story.branch_name)
                .await?
                .or_else(|| work.commit_sha.clone())
        } else {
            work.commit_sha.clone()
        };

        let Some(commit_sha) = commit_sha else {
            // Nothing salvageable after all; settle as terminal.
            let key = ctx.checkpoint_key(epic, story);
            ctx.checkpoints
                .mark_completed(&key, StoryStatus::Failed, &story.branch_name, None)?;
            ctx.record_event(
                EventType::StoryFailed,
                "recovery",
                json!({
                    "story_id": story.id,
                    "epic_id": epic.id,
                    "status": "failed",
                    "category": analysis.category.as_str(),
                    "is_terminal": true,
                    "error": failure.error.to_string(),
                }),
            )?;
            let mut result = StoryPipelineResult::failed(
                &story.id,
                &story.branch_name,
                failure.error.to_string(),
            );
            result.costs = costs;
            result.usage = usage;
            result.failure_category = Some(analysis.category.as_str().to_string());
            return Ok(RecoveryVerdict::Settled(Box::new(result)));
        };

        ctx.git
            .ensure_commit_on_remote(&repo_path, &story.branch_name, &commit_sha)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "salvaged commit not confirmed on remote");
            });
        let key = ctx.checkpoint_key(epic, story);
        // The checkpoint may already sit past `pushed` (a judge-stage crash,
        // for instance); only advance it, never regress it.
        let can_mark_pushed = ctx
            .checkpoints
            .load(&key)?
            .map(|p| p.stage.allows_transition_to(StoryStatus::Pushed))
            .unwrap_or(true);
        if can_mark_pushed {
            ctx.checkpoints.save(
                &key,
                StoryStatus::Pushed,
                CheckpointExtra::with_commit(&commit_sha),
            )?;
        }
        let _ = ctx
            .git
            .push(
                &repo_path,
                &story.branch_name,
                PushOpts {
                    set_upstream: true,
                    ..Default::default()
                },
            )
            .await;

        let (files_modified, files_created) = failure
            .developer_output
            .as_ref()
            .map(|o| (o.files_modified.clone(), o.files_created.clone()))
            .unwrap_or_default();

        let judge = run_judge_stage(
            ctx,
            story,
            epic,
            &commit_sha,
            files_modified,
            files_created,
            1,
        )
        .await
        .map_err(anyhow::Error::from)?;
        costs.judge += judge.result.cost_usd;
        usage.judge.add(judge.result.tokens);

        if !judge.result.approved {
            let result = StoryPipeline::finalize_rejected(ctx, story, epic, &judge, costs, usage)?;
            return Ok(RecoveryVerdict::Settled(Box::new(StoryPipelineResult {
                recovered_from_failure: true,
                original_error: Some(failure.error.to_string()),
                ..result
            })));
        }

        let merge: MergeStageResult = run_merge_stage(ctx, story, epic)
            .await
            .map_err(anyhow::Error::from)?;
        costs.conflict_resolution += merge.conflict_resolution_cost;
        usage.conflict_resolution.add(merge.conflict_resolution_usage);

        if merge.merge_conflict {
            let result = StoryPipeline::finalize_merge_conflict(
                ctx,
                story,
                epic,
                &commit_sha,
                merge.conflict_unresolvable_reason.clone(),
                costs,
                usage,
            )?;
            return Ok(RecoveryVerdict::Settled(Box::new(result)));
        }

        let result = StoryPipeline::finalize_completed(
            ctx,
            story,
            epic,
            &commit_sha,
            &merge,
            None,
            true,
            Some(failure.error.to_string()),
            costs,
            usage,
        )?;
        Ok(RecoveryVerdict::Settled(Box::new(result)))
    }
}
