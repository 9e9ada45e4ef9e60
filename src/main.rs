use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use foreman::agent::CliAgentRunner;
use foreman::checkpoint::CheckpointStore;
use foreman::config::OrchestratorConfig;
use foreman::coordinator::EpicCoordinator;
use foreman::event::{EventLog, EventType, NewEvent};
use foreman::git::GitGateway;
use foreman::model::{Epic, Story, Task};
use foreman::notify::BroadcastNotifier;
use foreman::pipeline::PipelineContext;
use foreman::sandbox::ProcessSandbox;
use foreman::workspace::WorkspaceLayout;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "LLM agent crew orchestrator")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full task pipeline from a task description file
    Run {
        /// Path to the task JSON (task, epics, stories)
        #[arg(long)]
        task_file: PathBuf,
        /// Number of developer instances to label work with
        #[arg(long, default_value = "1")]
        developers: usize,
    },
    /// Print the folded event-log state for a task
    State {
        #[arg(long)]
        task_id: String,
    },
    /// Check structural invariants of a task's state
    Validate {
        #[arg(long)]
        task_id: String,
    },
}

/// On-disk task description consumed by `foreman run`.
#[derive(serde::Deserialize)]
struct TaskFile {
    task: Task,
    #[serde(default)]
    epics: Vec<Epic>,
    #[serde(default)]
    stories: Vec<Story>,
}

fn init_tracing(config: &OrchestratorConfig, verbose: bool) {
    let directive = if verbose {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn event_log_path(config: &OrchestratorConfig) -> PathBuf {
    config.workspace_root.join("foreman-events.db")
}

fn checkpoint_path(config: &OrchestratorConfig) -> PathBuf {
    config.workspace_root.join("foreman-checkpoints.db")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = OrchestratorConfig::from_env();
    init_tracing(&config, cli.verbose);

    match cli.command {
        Commands::Run {
            task_file,
            developers,
        } => run_task(config, &task_file, developers).await,
        Commands::State { task_id } => {
            std::fs::create_dir_all(&config.workspace_root)
                .context("Failed to create workspace root")?;
            let events = EventLog::new(&event_log_path(&config))?;
            let snapshot = events.current_state(&task_id)?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
        Commands::Validate { task_id } => {
            std::fs::create_dir_all(&config.workspace_root)
                .context("Failed to create workspace root")?;
            let events = EventLog::new(&event_log_path(&config))?;
            let violations = events.validate_state(&task_id)?;
            if violations.is_empty() {
                println!("state OK");
            } else {
                for violation in &violations {
                    println!("violation: {}", violation);
                }
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn run_task(config: OrchestratorConfig, task_file: &PathBuf, developers: usize) -> Result<()> {
    let raw = std::fs::read_to_string(task_file)
        .with_context(|| format!("Failed to read task file {}", task_file.display()))?;
    let parsed: TaskFile = serde_json::from_str(&raw).context("Failed to parse task file")?;

    if !config.api_key_present {
        tracing::warn!("ANTHROPIC_API_KEY is not set; agent invocations will likely fail");
    }

    std::fs::create_dir_all(&config.workspace_root)
        .context("Failed to create workspace root")?;
    let events = Arc::new(EventLog::new(&event_log_path(&config))?);
    let checkpoints = Arc::new(CheckpointStore::new(&checkpoint_path(&config))?);

    let mut task = parsed.task;
    if task.epic_ids.is_empty() {
        task.epic_ids = parsed.epics.iter().map(|e| e.id.clone()).collect();
    }

    // Derive branch names for records that omit them.
    let mut epics = parsed.epics;
    for epic in &mut epics {
        if epic.branch_name.trim().is_empty() {
            epic.branch_name = format!("epic/{}", epic.id);
        }
    }
    let mut stories = parsed.stories;
    for story in &mut stories {
        if story.branch_name.trim().is_empty() {
            story.branch_name = format!(
                "story/{}-{}",
                story.id,
                foreman::util::slugify(&story.title, 40)
            );
        }
    }

    let workspace = WorkspaceLayout::new(&config.workspace_root, &task.id);
    workspace.ensure()?;

    let git = GitGateway::new(config.clone());
    for repo in &task.repositories {
        let path = workspace.repo_path(&repo.name);
        if !path.exists() {
            tracing::info!(repo = %repo.name, "cloning into workspace");
            git.clone_repo(&repo.clone_url, &path).await?;
        }
    }

    // Seed the log; safe_append keeps reruns idempotent.
    events.safe_append(NewEvent::new(
        &task.id,
        EventType::EnvironmentConfigured,
        "cli",
        serde_json::json!({"environment": task.environment}),
    ))?;
    for epic in &epics {
        events.safe_append(NewEvent::new(
            &task.id,
            EventType::EpicCreated,
            "cli",
            serde_json::json!({"epic": epic, "epic_id": epic.id}),
        ))?;
    }
    for story in &stories {
        events.safe_append(NewEvent::new(
            &task.id,
            EventType::StoryCreated,
            "cli",
            serde_json::json!({"story": story, "story_id": story.id, "epic_id": story.epic_id}),
        ))?;
    }

    let ctx = PipelineContext {
        task,
        workspace,
        events,
        checkpoints,
        git,
        sandbox: Arc::new(ProcessSandbox::new()),
        runner: Arc::new(CliAgentRunner::new()),
        notifier: Arc::new(BroadcastNotifier::default()),
        config,
        cancel: CancellationToken::new(),
    };

    let coordinator = EpicCoordinator::new(developers);
    let report = coordinator.run_task_pipeline(&ctx).await;

    // The workspace is torn down at task end; anything that failed or parked
    // keeps its clones around for inspection.
    if report.error.is_none() && report.failed == 0 {
        if let Err(e) = ctx.workspace.destroy() {
            tracing::warn!(error = %format!("{:#}", e), "workspace cleanup failed");
        }
    }

    println!(
        "task {}: {} succeeded, {} failed, {} stories across {} epics (${:.2})",
        ctx.task.id,
        report.successful,
        report.failed,
        report.stories_implemented,
        report.epics_count,
        report.total_cost_usd,
    );
    if let Some(error) = report.error {
        anyhow::bail!("coordinator error: {}", error);
    }
    Ok(())
}
