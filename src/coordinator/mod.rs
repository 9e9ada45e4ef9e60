//! Epic coordinator: orders epics, runs stories strictly sequentially.
//!
//! Sequential story execution is a correctness property, not an
//! optimisation: each story branches from the epic head and therefore sees
//! every previously merged story. The coordinator always emits a
//! terminating `DevelopersCompleted` event, even when it fails before the
//! first story, so outer state machines never hang.

pub mod ordering;

use std::time::Duration;

use serde_json::json;

use crate::errors::CoordinatorError;
use crate::event::EventType;
use crate::model::{CostBreakdown, Epic, Story, StoryPipelineResult};
use crate::notify::LogLevel;
use crate::pipeline::{PipelineContext, StoryPipeline};
use crate::recovery::{RecoveryService, RecoveryVerdict};

/// Aggregate outcome of one task pipeline run.
#[derive(Debug, Default)]
pub struct CoordinatorReport {
    pub successful: usize,
    pub failed: usize,
    pub stories_implemented: usize,
    pub epics_count: usize,
    pub total_cost_usd: f64,
    pub results: Vec<StoryPipelineResult>,
    pub error: Option<String>,
}

/// Runs every epic of a task to completion.
pub struct EpicCoordinator {
    /// How many developer instances exist. Within sequential execution the
    /// instance id is a label on the work, not a concurrency axis.
    developer_instances: usize,
}

impl Default for EpicCoordinator {
    fn default() -> Self {
        Self {
            developer_instances: 1,
        }
    }
}

impl EpicCoordinator {
    pub fn new(developer_instances: usize) -> Self {
        Self {
            developer_instances: developer_instances.max(1),
        }
    }

    /// Run the full task pipeline. Always emits `DevelopersCompleted`.
    ///
    /// A coordinator-level failure (invariant violation, cost ceiling,
    /// branch setup) aborts further work but keeps everything already
    /// accumulated: stories that merged before the abort stay counted and
    /// costed in the returned report.
    pub async fn run_task_pipeline(&self, ctx: &PipelineContext) -> CoordinatorReport {
        let mut report = CoordinatorReport::default();
        if let Err(e) = self.run_inner(ctx, &mut report).await {
            let message = format!("{:#}", e);
            tracing::error!(task_id = %ctx.task.id, error = %message, "coordinator failed");
            report.error = Some(message);
        }

        let payload = json!({
            "successful": report.successful,
            "failed": report.failed + usize::from(report.error.is_some()),
            "stories_implemented": report.stories_implemented,
            "epics_count": report.epics_count,
            "total_cost_usd": report.total_cost_usd,
            "error": report.error,
        });
        if let Err(e) = ctx.record_event(EventType::DevelopersCompleted, "coordinator", payload) {
            // The terminating event must never be lost silently.
            tracing::error!(error = %format!("{:#}", e), "failed to record DevelopersCompleted");
            if report.error.is_none() {
                report.error = Some(format!("failed to record DevelopersCompleted: {:#}", e));
            }
        }
        report
    }

    async fn run_inner(
        &self,
        ctx: &PipelineContext,
        report: &mut CoordinatorReport,
    ) -> anyhow::Result<()> {
        let violations = ctx.events.validate_state(&ctx.task.id)?;
        if !violations.is_empty() {
            anyhow::bail!("task state invalid: {}", violations.join("; "));
        }

        let snapshot = ctx.events.current_state(&ctx.task.id)?;
        if snapshot.epics.is_empty() {
            return Err(CoordinatorError::NoEpics {
                task_id: ctx.task.id.clone(),
            }
            .into());
        }

        // Epics in submission order (the fold loses it), then dependency
        // ordering with the conservative cross-repo policy on top.
        let mut epics: Vec<Epic> = Vec::new();
        for id in &ctx.task.epic_ids {
            if let Some(epic) = snapshot.epics.get(id) {
                epics.push(epic.clone());
            }
        }
        for epic in snapshot.epics.values() {
            if !ctx.task.epic_ids.contains(&epic.id) {
                epics.push(epic.clone());
            }
        }
        let order = ordering::order_epics(&epics)?;
        tracing::info!(task_id = %ctx.task.id, ?order, "epic execution order resolved");
        ctx.notifier.emit(
            &ctx.task.id,
            "epic_order_resolved",
            json!({"order": order}),
        );

        report.epics_count = order.len();
        let mut instance_cursor = 0usize;

        for epic_id in &order {
            let Some(epic) = snapshot.epics.get(epic_id) else {
                continue;
            };
            self.prepare_epic_branch(ctx, epic).await?;

            for story_id in &epic.story_ids {
                if ctx.cancel.is_cancelled() {
                    tracing::info!(task_id = %ctx.task.id, "cancellation requested; stopping before next story");
                    return Ok(());
                }
                let Some(story) = snapshot.stories.get(story_id) else {
                    continue;
                };
                if story.status.is_settled() {
                    report.stories_implemented += 1;
                    if story.status == crate::model::StoryStatus::Completed {
                        report.successful += 1;
                    } else {
                        report.failed += 1;
                    }
                    continue;
                }

                if let Some(ceiling) = ctx.config.max_cost_per_task
                    && report.total_cost_usd > ceiling
                {
                    return Err(CoordinatorError::CostCeilingExceeded {
                        task_id: ctx.task.id.clone(),
                        spent: report.total_cost_usd,
                        ceiling,
                    }
                    .into());
                }

                let instance = format!("dev-{}", instance_cursor % self.developer_instances + 1);
                instance_cursor += 1;
                ctx.console(
                    LogLevel::Info,
                    &format!("starting story {} on {} ({})", story.id, epic.id, instance),
                );

                let result = Self::run_story_with_recovery(ctx, story, epic).await;
                report.total_cost_usd += result.costs.total();
                report.stories_implemented += 1;
                if result.success {
                    report.successful += 1;
                } else {
                    report.failed += 1;
                }
                report.results.push(result);
            }
        }

        Ok(())
    }

    /// Invariant: the epic branch is created from the default branch before
    /// any story on the epic runs, and exists on the remote.
    async fn prepare_epic_branch(
        &self,
        ctx: &PipelineContext,
        epic: &Epic,
    ) -> anyhow::Result<()> {
        let repo = ctx
            .task
            .repository(&epic.repository)
            .ok_or_else(|| anyhow::anyhow!("epic {} targets unknown repository {}", epic.id, epic.repository))?;
        let repo_path = ctx.repo_path(epic);

        if let Err(e) = ctx.git.fetch(&repo_path).await {
            tracing::warn!(error = %e, "fetch before epic branch setup failed");
        }
        ctx.git
            .checkout(&repo_path, &epic.branch_name, Some(&repo.default_branch))
            .await?;
        ctx.git
            .ensure_branch_on_remote(&repo_path, &epic.branch_name)
            .await?;
        ctx.record_event(
            EventType::EpicCreated,
            "coordinator",
            json!({"epic": epic, "epic_id": epic.id}),
        )?;
        Ok(())
    }

    /// One story: pipeline run, recovery on stage failure, bounded retries.
    async fn run_story_with_recovery(
        ctx: &PipelineContext,
        story: &Story,
        epic: &Epic,
    ) -> StoryPipelineResult {
        let mut attempts = 0u32;
        let mut spent = CostBreakdown::default();

        loop {
            match StoryPipeline::run(ctx, story, epic).await {
                Ok(mut result) => {
                    result.costs.developer += spent.developer;
                    result.costs.judge += spent.judge;
                    result.costs.conflict_resolution += spent.conflict_resolution;
                    return result;
                }
                Err(failure) => {
                    // Cancellation is not a failure to recover from: the
                    // checkpoint records where execution paused and the story
                    // resumes on the next run.
                    if matches!(failure.error, crate::errors::PipelineError::Cancelled { .. }) {
                        let mut result = StoryPipelineResult::failed(
                            &story.id,
                            &story.branch_name,
                            failure.error.to_string(),
                        );
                        result.costs = failure.costs;
                        result.costs.developer += spent.developer;
                        result.costs.judge += spent.judge;
                        result.costs.conflict_resolution += spent.conflict_resolution;
                        result.usage = failure.usage;
                        result.failure_category = Some("CANCELLED".into());
                        return result;
                    }
                    let attempt_costs = failure.costs;
                    match RecoveryService::recover(ctx, story, epic, *failure, attempts).await {
                        RecoveryVerdict::Retry { delay_ms } => {
                            spent.developer += attempt_costs.developer;
                            spent.judge += attempt_costs.judge;
                            spent.conflict_resolution += attempt_costs.conflict_resolution;
                            attempts += 1;
                            tracing::info!(
                                story_id = %story.id,
                                attempt = attempts,
                                delay_ms,
                                "re-entering pipeline after recovery verdict"
                            );
                            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        }
                        RecoveryVerdict::Settled(mut result) => {
                            result.costs.developer += spent.developer;
                            result.costs.judge += spent.judge;
                            result.costs.conflict_resolution += spent.conflict_resolution;
                            return *result;
                        }
                    }
                }
            }
        }
    }
}
