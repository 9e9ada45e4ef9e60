//! The story pipeline: Developer → Git Validation → Judge → Merge.
//!
//! Every stage is idempotent with respect to the checkpoint store, so a
//! pipeline entered after a crash or restart jumps to the earliest
//! unfinished stage. Stage boundaries return typed results; errors cross
//! exactly one boundary, into the recovery service, carrying the cost and
//! token data accumulated so far.

pub mod conflict;
mod context;
mod developer;
mod judge;
mod merge;
mod validation;

pub use context::PipelineContext;
pub use developer::run_developer_stage;
pub use judge::run_judge_stage;
pub use merge::run_merge_stage;
pub use validation::run_validation_stage;

use serde_json::json;

use crate::config::GitOperationKind;
use crate::errors::PipelineError;
use crate::event::EventType;
use crate::model::{
    CostBreakdown, DeveloperOutput, Epic, JudgeStageResult, RejectReason, Story,
    StoryPipelineResult, StoryStatus, UsageBreakdown,
};
use crate::notify::LogLevel;

/// A stage error plus the accounting accumulated before it.
#[derive(Debug)]
pub struct StageFailure {
    pub stage: &'static str,
    pub error: PipelineError,
    pub costs: CostBreakdown,
    pub usage: UsageBreakdown,
    pub developer_output: Option<DeveloperOutput>,
}

/// Where a resumed pipeline re-enters.
#[derive(Debug, Clone)]
enum EntryPoint {
    Developer,
    Validation,
    Judge { commit_sha: String },
    AlreadyDone { commit_sha: Option<String> },
    ParkedOnConflict,
    AlreadyTerminal { status: StoryStatus },
}

/// Drives one story through the four stages.
pub struct StoryPipeline;

impl StoryPipeline {
    /// Run one story to a settled outcome.
    ///
    /// Errors carry partial accounting and are meant for the recovery
    /// service; they never leave the coordinator.
    pub async fn run(
        ctx: &PipelineContext,
        story: &Story,
        epic: &Epic,
    ) -> Result<StoryPipelineResult, Box<StageFailure>> {
        let mut costs = CostBreakdown::default();
        let mut usage = UsageBreakdown::default();

        let entry = Self::entry_point(ctx, story, epic)
            .map_err(|e| fail("checkpoint", e, &costs, &usage, None))?;

        match &entry {
            EntryPoint::AlreadyDone { commit_sha } => {
                return Ok(StoryPipelineResult {
                    story_id: story.id.clone(),
                    success: true,
                    commit_sha: commit_sha.clone(),
                    branch_name: story.branch_name.clone(),
                    merged: true,
                    ..zero_result(story)
                });
            }
            EntryPoint::ParkedOnConflict => {
                return Ok(StoryPipelineResult {
                    merge_conflict: true,
                    ..zero_result(story)
                });
            }
            EntryPoint::AlreadyTerminal { status } => {
                return Ok(StoryPipelineResult {
                    reject_reason: (*status == StoryStatus::Rejected)
                        .then_some(RejectReason::Other),
                    ..zero_result(story)
                });
            }
            _ => {}
        }

        // ── Stage A: Developer ───────────────────────────────────────
        let developer_output = match &entry {
            EntryPoint::Developer => {
                check_cancel(ctx, "developer")
                    .map_err(|e| fail("developer", e, &costs, &usage, None))?;
                let stage = run_developer_stage(ctx, story, epic)
                    .await
                    .map_err(|e| fail("developer", e, &costs, &usage, None))?;
                costs.developer += stage.output.cost_usd;
                usage.developer.add(stage.output.tokens);
                stage.output
            }
            _ => Self::synthesize_developer_output(ctx, story, epic),
        };

        // ── Stage B: Git Validation ──────────────────────────────────
        let commit_sha = match &entry {
            EntryPoint::Judge { commit_sha } => commit_sha.clone(),
            _ => {
                check_cancel(ctx, "git_validation").map_err(|e| {
                    fail("git_validation", e, &costs, &usage, Some(&developer_output))
                })?;
                let validation = run_validation_stage(ctx, story, epic, &developer_output)
                    .await
                    .map_err(|e| {
                        fail("git_validation", e, &costs, &usage, Some(&developer_output))
                    })?;
                match validation.commit_sha {
                    Some(sha) if !validation.failed => sha,
                    _ => {
                        return Err(fail(
                            "git_validation",
                            PipelineError::NoWorkProduced {
                                story_id: story.id.clone(),
                            },
                            &costs,
                            &usage,
                            Some(&developer_output),
                        ));
                    }
                }
            }
        };

        // ── Stage C: Judge ───────────────────────────────────────────
        check_cancel(ctx, "judge")
            .map_err(|e| fail("judge", e, &costs, &usage, Some(&developer_output)))?;
        let judge = run_judge_stage(
            ctx,
            story,
            epic,
            &commit_sha,
            developer_output.files_modified.clone(),
            developer_output.files_created.clone(),
            1,
        )
        .await
        .map_err(|e| fail("judge", e, &costs, &usage, Some(&developer_output)))?;
        costs.judge += judge.result.cost_usd;
        usage.judge.add(judge.result.tokens);

        let (approved, commit_sha, specialist) = if judge.result.approved {
            (true, commit_sha, None)
        } else if judge.result.reject_reason == Some(RejectReason::Conflicts) {
            // Specialist route: conflict resolver, then judge exactly once.
            let routed = Self::specialist_route(
                ctx,
                story,
                epic,
                &commit_sha,
                &developer_output,
                &mut costs,
                &mut usage,
            )
            .await;
            let (rejudge, new_sha) = match routed {
                Ok(pair) => pair,
                Err(e) => {
                    return Err(fail(
                        "conflict_resolver",
                        e,
                        &costs,
                        &usage,
                        Some(&developer_output),
                    ));
                }
            };
            costs.judge += rejudge.result.cost_usd;
            usage.judge.add(rejudge.result.tokens);
            if rejudge.result.approved {
                (true, new_sha, Some("ConflictResolver".to_string()))
            } else {
                return Self::finalize_rejected(ctx, story, epic, &rejudge, costs, usage)
                    .map_err(|e| fail("judge", e.into(), &costs, &usage, Some(&developer_output)));
            }
        } else {
            return Self::finalize_rejected(ctx, story, epic, &judge, costs, usage)
                .map_err(|e| fail("judge", e.into(), &costs, &usage, Some(&developer_output)));
        };
        debug_assert!(approved);

        // ── Stage D: Merge ───────────────────────────────────────────
        check_cancel(ctx, "merge")
            .map_err(|e| fail("merge", e, &costs, &usage, Some(&developer_output)))?;
        let merge = run_merge_stage(ctx, story, epic)
            .await
            .map_err(|e| fail("merge", e, &costs, &usage, Some(&developer_output)))?;
        costs.conflict_resolution += merge.conflict_resolution_cost;
        usage.conflict_resolution.add(merge.conflict_resolution_usage);

        if merge.merge_conflict {
            return Self::finalize_merge_conflict(
                ctx,
                story,
                epic,
                &commit_sha,
                merge.conflict_unresolvable_reason.clone(),
                costs,
                usage,
            )
            .map_err(|e| fail("merge", e.into(), &costs, &usage, Some(&developer_output)));
        }

        Self::finalize_completed(
            ctx,
            story,
            epic,
            &commit_sha,
            &merge,
            specialist,
            false,
            None,
            costs,
            usage,
        )
        .map_err(|e| fail("merge", e.into(), &costs, &usage, Some(&developer_output)))
    }

    /// Decide where to enter based on the checkpoint store.
    fn entry_point(
        ctx: &PipelineContext,
        story: &Story,
        epic: &Epic,
    ) -> Result<EntryPoint, PipelineError> {
        let key = ctx.checkpoint_key(epic, story);
        let Some(progress) = ctx.checkpoints.load(&key)? else {
            return Ok(EntryPoint::Developer);
        };
        Ok(match progress.stage {
            StoryStatus::MergedToEpic | StoryStatus::Completed => EntryPoint::AlreadyDone {
                commit_sha: progress.commit_hash,
            },
            StoryStatus::Pushed | StoryStatus::JudgeEvaluating => match progress.commit_hash {
                Some(commit_sha) => EntryPoint::Judge { commit_sha },
                // A pushed checkpoint without a recorded commit re-validates.
                None => EntryPoint::Validation,
            },
            StoryStatus::CodeWritten => EntryPoint::Validation,
            StoryStatus::MergeConflict => EntryPoint::ParkedOnConflict,
            status if status.is_terminal() => EntryPoint::AlreadyTerminal { status },
            _ => EntryPoint::Developer,
        })
    }

    /// Developer output stood up from the checkpoint on resume. Costs were
    /// accounted when the stage originally ran, so this carries zero.
    fn synthesize_developer_output(
        ctx: &PipelineContext,
        story: &Story,
        epic: &Epic,
    ) -> DeveloperOutput {
        let key = ctx.checkpoint_key(epic, story);
        let progress = ctx.checkpoints.load(&key).ok().flatten();
        let mut output = DeveloperOutput::failed(&story.id, &story.branch_name);
        output.success = true;
        if let Some(progress) = progress {
            output.commit_sha = progress.commit_hash.unwrap_or_default();
            output.files_modified = progress.files_modified;
            output.files_created = progress.files_created;
            output.sdk_session_id = progress.sdk_session_id;
        }
        output
    }

    /// Judge rejected with `conflicts`: clean the branch with the resolver
    /// and re-run the judge exactly once.
    async fn specialist_route(
        ctx: &PipelineContext,
        story: &Story,
        epic: &Epic,
        commit_sha: &str,
        developer_output: &DeveloperOutput,
        costs: &mut CostBreakdown,
        usage: &mut UsageBreakdown,
    ) -> Result<(JudgeStageResult, String), PipelineError> {
        let repo_path = ctx.repo_path(epic);
        ctx.console(
            LogLevel::Info,
            &format!("routing {} to the conflict resolver", story.id),
        );

        ctx.git
            .checkout(&repo_path, &story.branch_name, Some(&epic.branch_name))
            .await?;
        let grep = ctx
            .git
            .run(
                &repo_path,
                &["grep", "-l", "<<<<<<<"],
                GitOperationKind::Status,
            )
            .await?;
        let markered: Vec<String> = grep
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let mut resolved_sha = commit_sha.to_string();
        if !markered.is_empty() {
            let resolution = merge::resolve_markered_files(
                ctx,
                epic,
                &repo_path,
                &markered,
                &format!("fix: resolve conflict markers for story: {}", story.title),
            )
            .await?;
            costs.conflict_resolution += resolution.ai_cost;
            usage.conflict_resolution.add(resolution.ai_usage);
            if resolution.resolved {
                ctx.git
                    .push(
                        &repo_path,
                        &story.branch_name,
                        crate::git::PushOpts {
                            set_upstream: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                resolved_sha = ctx.git.head_sha(&repo_path).await?;
            }
        }

        let rejudge = run_judge_stage(
            ctx,
            story,
            epic,
            &resolved_sha,
            developer_output.files_modified.clone(),
            developer_output.files_created.clone(),
            2,
        )
        .await?;
        Ok((rejudge, resolved_sha))
    }

    /// Terminal success: checkpoint, event, result.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn finalize_completed(
        ctx: &PipelineContext,
        story: &Story,
        epic: &Epic,
        commit_sha: &str,
        merge: &crate::model::MergeStageResult,
        resolved_by_specialist: Option<String>,
        recovered_from_failure: bool,
        original_error: Option<String>,
        costs: CostBreakdown,
        usage: UsageBreakdown,
    ) -> anyhow::Result<StoryPipelineResult> {
        let key = ctx.checkpoint_key(epic, story);
        ctx.checkpoints
            .mark_completed(&key, StoryStatus::Completed, &story.branch_name, None)?;

        let mut payload = json!({
            "story_id": story.id,
            "epic_id": epic.id,
            "commit_sha": commit_sha,
            "merge_commit_sha": merge.merge_commit_sha,
            "costs": costs,
            "usage": usage,
        });
        if recovered_from_failure {
            payload["recovered_from_failure"] = json!(true);
            payload["original_error"] = json!(original_error);
        }
        if let Some(specialist) = &resolved_by_specialist {
            payload["resolved_by_specialist"] = json!(specialist);
        }
        if merge.conflict_auto_resolved {
            payload["merge_conflict_auto_resolved"] = json!(true);
        }
        ctx.record_event(EventType::StoryCompleted, "pipeline", payload)?;

        Ok(StoryPipelineResult {
            story_id: story.id.clone(),
            success: true,
            commit_sha: Some(commit_sha.to_string()),
            branch_name: story.branch_name.clone(),
            merged: true,
            merge_conflict: false,
            merge_conflict_auto_resolved: merge.conflict_auto_resolved,
            reject_reason: None,
            resolved_by_specialist,
            recovered_from_failure,
            original_error,
            failure_category: None,
            costs,
            usage,
        })
    }

    /// Terminal rejection: branch preserved for human inspection.
    pub(crate) fn finalize_rejected(
        ctx: &PipelineContext,
        story: &Story,
        epic: &Epic,
        judge: &JudgeStageResult,
        costs: CostBreakdown,
        usage: UsageBreakdown,
    ) -> anyhow::Result<StoryPipelineResult> {
        let key = ctx.checkpoint_key(epic, story);
        ctx.checkpoints
            .mark_completed(&key, StoryStatus::Rejected, &story.branch_name, None)?;
        let reject_reason = judge.result.reject_reason.unwrap_or(RejectReason::Other);
        ctx.record_event(
            EventType::StoryFailed,
            "pipeline",
            json!({
                "story_id": story.id,
                "epic_id": epic.id,
                "status": "rejected",
                "category": "JUDGE_REJECTED",
                "reject_reason": reject_reason.as_str(),
                "feedback": judge.result.feedback,
                "costs": costs,
            }),
        )?;
        Ok(StoryPipelineResult {
            reject_reason: Some(reject_reason),
            failure_category: Some("JUDGE_REJECTED".into()),
            costs,
            usage,
            ..zero_result(story)
        })
    }

    /// Both resolution attempts failed: park the story, keep going.
    pub(crate) fn finalize_merge_conflict(
        ctx: &PipelineContext,
        story: &Story,
        epic: &Epic,
        commit_sha: &str,
        resolver_reason: Option<String>,
        costs: CostBreakdown,
        usage: UsageBreakdown,
    ) -> anyhow::Result<StoryPipelineResult> {
        let key = ctx.checkpoint_key(epic, story);
        ctx.checkpoints.save(
            &key,
            StoryStatus::MergeConflict,
            crate::checkpoint::CheckpointExtra::with_commit(commit_sha),
        )?;
        let mut payload = json!({
            "story_id": story.id,
            "epic_id": epic.id,
            "status": "merge_conflict",
            "merge_conflict": true,
            "commit_sha": commit_sha,
            "costs": costs,
        });
        if let Some(reason) = &resolver_reason {
            payload["resolver_reason"] = json!(reason);
        }
        ctx.record_event(EventType::StoryFailed, "pipeline", payload)?;
        ctx.console(
            LogLevel::Warn,
            &format!(
                "story {} parked with unresolved merge conflict; branch {} preserved",
                story.id, story.branch_name
            ),
        );
        Ok(StoryPipelineResult {
            commit_sha: Some(commit_sha.to_string()),
            merge_conflict: true,
            costs,
            usage,
            ..zero_result(story)
        })
    }
}

fn zero_result(story: &Story) -> StoryPipelineResult {
    StoryPipelineResult {
        story_id: story.id.clone(),
        success: false,
        commit_sha: None,
        branch_name: story.branch_name.clone(),
        merged: false,
        merge_conflict: false,
        merge_conflict_auto_resolved: false,
        reject_reason: None,
        resolved_by_specialist: None,
        recovered_from_failure: false,
        original_error: None,
        failure_category: None,
        costs: CostBreakdown::default(),
        usage: UsageBreakdown::default(),
    }
}

fn check_cancel(ctx: &PipelineContext, stage: &str) -> Result<(), PipelineError> {
    if ctx.cancel.is_cancelled() {
        Err(PipelineError::Cancelled {
            stage: stage.to_string(),
        })
    } else {
        Ok(())
    }
}

fn fail(
    stage: &'static str,
    error: PipelineError,
    costs: &CostBreakdown,
    usage: &UsageBreakdown,
    developer_output: Option<&DeveloperOutput>,
) -> Box<StageFailure> {
    Box::new(StageFailure {
        stage,
        error,
        costs: *costs,
        usage: *usage,
        developer_output: developer_output.cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_result_has_no_cost() {
        let story = Story {
            id: "S1".into(),
            title: "t".into(),
            epic_id: "E1".into(),
            branch_name: "story/S1-001".into(),
            acceptance_criteria: vec![],
            status: StoryStatus::NotStarted,
        };
        let result = zero_result(&story);
        assert_eq!(result.costs.total(), 0.0);
        assert!(!result.success);
        assert_eq!(result.branch_name, "story/S1-001");
    }

    #[test]
    fn test_stage_failure_preserves_accounting() {
        let costs = CostBreakdown {
            developer: 1.0,
            judge: 0.5,
            conflict_resolution: 0.0,
        };
        let usage = UsageBreakdown::default();
        let failure = fail(
            "judge",
            PipelineError::AgentFailed {
                stage: "judge".into(),
                message: "boom".into(),
            },
            &costs,
            &usage,
            None,
        );
        assert_eq!(failure.stage, "judge");
        assert!((failure.costs.total() - 1.5).abs() < f64::EPSILON);
    }
}
