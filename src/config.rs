//! Runtime configuration for the orchestrator.
//!
//! Configuration is read from the process environment once at startup and
//! threaded through the task-scoped context; no module reads env vars at
//! call time.

use std::path::PathBuf;
use std::time::Duration;

/// Default base delay for classifier backoff.
const BACKOFF_BASE_SECS: u64 = 5;

/// Ceiling for any single backoff delay.
const BACKOFF_CAP_SECS: u64 = 60;

/// Retry ceilings per failure category.
///
/// The network ceiling defaults to the aggressive 10x variant; use
/// [`RetryPolicy::conservative`] for the modest policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Max retries for transient network failures
    pub network_retries: u32,
    /// Max retries for git command failures
    pub git_retries: u32,
    /// Max retries for timed-out operations
    pub timeout_retries: u32,
    /// Max retries for upstream API / rate-limit failures
    pub api_retries: u32,
    /// Max retries for unclassified failures
    pub unknown_retries: u32,
    /// Base delay for exponential backoff
    pub backoff_base: Duration,
    /// Ceiling for a single backoff delay
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            network_retries: 10,
            git_retries: 5,
            timeout_retries: 5,
            api_retries: 3,
            unknown_retries: 3,
            backoff_base: Duration::from_secs(BACKOFF_BASE_SECS),
            backoff_cap: Duration::from_secs(BACKOFF_CAP_SECS),
        }
    }
}

impl RetryPolicy {
    /// The modest policy: network failures retry 5x instead of 10x.
    pub fn conservative() -> Self {
        Self {
            network_retries: 5,
            ..Default::default()
        }
    }

    /// Set the network retry ceiling.
    pub fn with_network_retries(mut self, retries: u32) -> Self {
        self.network_retries = retries;
        self
    }

    /// Set the git retry ceiling.
    pub fn with_git_retries(mut self, retries: u32) -> Self {
        self.git_retries = retries;
        self
    }

    /// Backoff delay for the given attempt: min(base * 2^attempt, cap).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.min(16));
        let delay = self.backoff_base.saturating_mul(exp as u32);
        delay.min(self.backoff_cap)
    }
}

/// Process-level configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Base directory for per-task workspaces
    pub workspace_root: PathBuf,
    /// Whether the sandbox should use bridge networking
    pub docker_bridge_mode: bool,
    /// Apply timeouts to git commands
    pub git_timeouts_enabled: bool,
    /// Budget ceiling in USD; the coordinator aborts a task above this
    pub max_cost_per_task: Option<f64>,
    /// Log level directive (debug|info|warn|error)
    pub log_level: String,
    /// Whether an Anthropic API key is present in the environment
    pub api_key_present: bool,
    /// Retry ceilings and backoff
    pub retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("agent-workspace"),
            docker_bridge_mode: false,
            git_timeouts_enabled: true,
            max_cost_per_task: None,
            log_level: "info".to_string(),
            api_key_present: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Build configuration from the process environment.
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("AGENT_WORKSPACE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("agent-workspace"));

        let docker_bridge_mode = env_flag("DOCKER_USE_BRIDGE_MODE", false);
        let git_timeouts_enabled = env_flag("GIT_ENABLE_TIMEOUTS", true);

        let max_cost_per_task = std::env::var("MAX_COST_PER_TASK")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| *v > 0.0);

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let api_key_present = std::env::var("ANTHROPIC_API_KEY")
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false);

        Self {
            workspace_root,
            docker_bridge_mode,
            git_timeouts_enabled,
            max_cost_per_task,
            log_level,
            api_key_present,
            retry: RetryPolicy::default(),
        }
    }

    /// Set the workspace root.
    pub fn with_workspace_root(mut self, root: PathBuf) -> Self {
        self.workspace_root = root;
        self
    }

    /// Set the cost ceiling.
    pub fn with_max_cost(mut self, ceiling: f64) -> Self {
        self.max_cost_per_task = Some(ceiling);
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Timeout for a git operation, or None when timeouts are disabled.
    pub fn git_timeout(&self, op: GitOperationKind) -> Option<Duration> {
        if !self.git_timeouts_enabled {
            return None;
        }
        Some(match op {
            GitOperationKind::Fetch => Duration::from_secs(90),
            GitOperationKind::Push => Duration::from_secs(120),
            GitOperationKind::Status => Duration::from_secs(15),
            GitOperationKind::Other => Duration::from_secs(60),
        })
    }
}

/// Kinds of git operations with distinct timeout budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitOperationKind {
    Fetch,
    Push,
    Status,
    Other,
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults_are_aggressive() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.network_retries, 10);
        assert_eq!(policy.git_retries, 5);
        assert_eq!(policy.api_retries, 3);
    }

    #[test]
    fn test_retry_policy_conservative() {
        let policy = RetryPolicy::conservative();
        assert_eq!(policy.network_retries, 5);
        assert_eq!(policy.git_retries, 5);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(10));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(20));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(40));
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(60));
        assert_eq!(policy.backoff_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_git_timeouts_per_operation() {
        let config = OrchestratorConfig::default();
        assert_eq!(
            config.git_timeout(GitOperationKind::Fetch),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            config.git_timeout(GitOperationKind::Push),
            Some(Duration::from_secs(120))
        );
        assert_eq!(
            config.git_timeout(GitOperationKind::Status),
            Some(Duration::from_secs(15))
        );
    }

    #[test]
    fn test_git_timeouts_disabled() {
        let config = OrchestratorConfig {
            git_timeouts_enabled: false,
            ..Default::default()
        };
        assert_eq!(config.git_timeout(GitOperationKind::Fetch), None);
    }

    #[test]
    fn test_builder_setters() {
        let config = OrchestratorConfig::default()
            .with_max_cost(25.0)
            .with_retry(RetryPolicy::conservative());
        assert_eq!(config.max_cost_per_task, Some(25.0));
        assert_eq!(config.retry.network_retries, 5);
    }
}
