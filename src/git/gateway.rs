use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use crate::config::{GitOperationKind, OrchestratorConfig};
use crate::errors::GitError;

/// Attempts for network-touching operations (fetch/push).
const NETWORK_ATTEMPTS: u32 = 3;

/// Base delay for git retry backoff.
const RETRY_BASE: Duration = Duration::from_secs(2);

/// Ceiling for a single git retry delay.
const RETRY_CAP: Duration = Duration::from_secs(60);

static TRANSIENT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)ECONNRESET|ENOTFOUND|ECONNREFUSED|ETIMEDOUT|connection reset|could not resolve host|early EOF|the remote end hung up|rate limit|too many requests|temporarily unavailable|connection timed out",
    )
    .expect("transient pattern compiles")
});

/// Result of one git command.
#[derive(Debug, Clone)]
pub struct GitResult {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Outcome of a merge attempt.
#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub ok: bool,
    pub conflicted_files: Vec<String>,
    pub merge_commit_sha: Option<String>,
}

/// Options for push.
#[derive(Debug, Clone, Copy, Default)]
pub struct PushOpts {
    pub force_with_lease: bool,
    pub set_upstream: bool,
}

/// Shell-level git operations with retry, backoff and timeouts.
#[derive(Clone)]
pub struct GitGateway {
    config: OrchestratorConfig,
}

impl GitGateway {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    /// Run one git command in the repository, honoring the configured
    /// timeout for the operation kind.
    pub async fn run(
        &self,
        repo_path: &Path,
        args: &[&str],
        kind: GitOperationKind,
    ) -> Result<GitResult, GitError> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(repo_path)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let operation = args.first().copied().unwrap_or("git").to_string();
        let fut = cmd.output();

        let output = match self.config.git_timeout(kind) {
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(GitError::Timeout {
                        operation,
                        timeout_secs: timeout.as_secs(),
                    });
                }
            },
            None => fut.await,
        }
        .map_err(GitError::SpawnFailed)?;

        Ok(GitResult {
            ok: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Run a network-touching command, retrying transient failures with
    /// exponential backoff. Non-transient failures surface immediately.
    async fn run_with_retry(
        &self,
        repo_path: &Path,
        args: &[&str],
        kind: GitOperationKind,
    ) -> Result<GitResult, GitError> {
        let operation = args.first().copied().unwrap_or("git").to_string();
        let mut last_error = String::new();

        for attempt in 0..NETWORK_ATTEMPTS {
            match self.run(repo_path, args, kind).await {
                Ok(result) if result.ok => return Ok(result),
                Ok(result) => {
                    if !is_transient(&result.stderr) {
                        return Err(GitError::CommandFailed {
                            operation,
                            repo_path: repo_path.to_path_buf(),
                            stderr: result.stderr,
                        });
                    }
                    last_error = result.stderr;
                }
                Err(GitError::Timeout { .. }) if attempt + 1 < NETWORK_ATTEMPTS => {
                    last_error = format!("{} timed out", operation);
                }
                Err(e) => return Err(e),
            }

            if attempt + 1 < NETWORK_ATTEMPTS {
                let delay = retry_delay(attempt);
                tracing::warn!(
                    operation = %operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "transient git failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(GitError::RetriesExhausted {
            operation,
            attempts: NETWORK_ATTEMPTS,
            last_error,
        })
    }

    // ── Repository setup ─────────────────────────────────────────────

    /// Clone a repository into the workspace.
    pub async fn clone_repo(
        &self,
        clone_url: &str,
        dest: &Path,
    ) -> Result<(), GitError> {
        let parent = dest.parent().unwrap_or(Path::new("."));
        let dest_name = dest
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| GitError::Other(anyhow::anyhow!("invalid clone destination")))?;
        let result = self
            .run_with_retry(parent, &["clone", clone_url, dest_name], GitOperationKind::Fetch)
            .await?;
        if result.ok {
            Ok(())
        } else {
            Err(GitError::CommandFailed {
                operation: "clone".into(),
                repo_path: dest.to_path_buf(),
                stderr: result.stderr,
            })
        }
    }

    /// Prune-fetch from origin. No-op when already up to date.
    pub async fn fetch(&self, repo_path: &Path) -> Result<(), GitError> {
        self.run_with_retry(
            repo_path,
            &["fetch", "--prune", "origin"],
            GitOperationKind::Fetch,
        )
        .await
        .map(|_| ())
    }

    // ── Branches and checkout ────────────────────────────────────────

    /// Idempotent checkout: prefer the local branch, then a tracking branch
    /// from the remote, then create from `create_from` when neither exists.
    pub async fn checkout(
        &self,
        repo_path: &Path,
        branch: &str,
        create_from: Option<&str>,
    ) -> Result<(), GitError> {
        let local = self
            .run(repo_path, &["checkout", branch], GitOperationKind::Other)
            .await?;
        if local.ok {
            return Ok(());
        }

        let remote_ref = format!("origin/{}", branch);
        let tracking = self
            .run(
                repo_path,
                &["checkout", "-b", branch, &remote_ref],
                GitOperationKind::Other,
            )
            .await?;
        if tracking.ok {
            return Ok(());
        }

        if let Some(base) = create_from {
            let created = self
                .run(
                    repo_path,
                    &["checkout", "-b", branch, base],
                    GitOperationKind::Other,
                )
                .await?;
            if created.ok {
                return Ok(());
            }
            return Err(GitError::CommandFailed {
                operation: "checkout".into(),
                repo_path: repo_path.to_path_buf(),
                stderr: created.stderr,
            });
        }

        Err(GitError::BranchNotFound {
            branch: branch.to_string(),
            repo_path: repo_path.to_path_buf(),
        })
    }

    /// Name of the currently checked-out branch.
    pub async fn current_branch(&self, repo_path: &Path) -> Result<String, GitError> {
        let result = self
            .run(
                repo_path,
                &["rev-parse", "--abbrev-ref", "HEAD"],
                GitOperationKind::Other,
            )
            .await?;
        if result.ok {
            Ok(result.stdout.trim().to_string())
        } else {
            Err(GitError::CommandFailed {
                operation: "rev-parse".into(),
                repo_path: repo_path.to_path_buf(),
                stderr: result.stderr,
            })
        }
    }

    /// SHA of HEAD.
    pub async fn head_sha(&self, repo_path: &Path) -> Result<String, GitError> {
        let result = self
            .run(repo_path, &["rev-parse", "HEAD"], GitOperationKind::Other)
            .await?;
        if result.ok {
            Ok(result.stdout.trim().to_string())
        } else {
            Err(GitError::CommandFailed {
                operation: "rev-parse".into(),
                repo_path: repo_path.to_path_buf(),
                stderr: result.stderr,
            })
        }
    }

    /// Hard-reset the working tree to a ref.
    pub async fn reset_hard(&self, repo_path: &Path, target: &str) -> Result<(), GitError> {
        let result = self
            .run(
                repo_path,
                &["reset", "--hard", target],
                GitOperationKind::Other,
            )
            .await?;
        if result.ok {
            Ok(())
        } else {
            Err(GitError::CommandFailed {
                operation: "reset".into(),
                repo_path: repo_path.to_path_buf(),
                stderr: result.stderr,
            })
        }
    }

    /// Delete a branch locally and, optionally, on the remote. Best-effort:
    /// a missing branch is not an error.
    pub async fn delete_branch(
        &self,
        repo_path: &Path,
        branch: &str,
        both_sides: bool,
    ) -> Result<(), GitError> {
        let _ = self
            .run(repo_path, &["branch", "-D", branch], GitOperationKind::Other)
            .await?;
        if both_sides {
            let _ = self
                .run(
                    repo_path,
                    &["push", "origin", "--delete", branch],
                    GitOperationKind::Push,
                )
                .await?;
        }
        Ok(())
    }

    // ── Commits ──────────────────────────────────────────────────────

    /// Stage all changes and commit. No-op on a clean tree; returns the new
    /// commit SHA otherwise.
    pub async fn commit_all(
        &self,
        repo_path: &Path,
        message: &str,
    ) -> Result<Option<String>, GitError> {
        let status = self
            .run(
                repo_path,
                &["status", "--porcelain"],
                GitOperationKind::Status,
            )
            .await?;
        if status.stdout.trim().is_empty() {
            return Ok(None);
        }

        let add = self
            .run(repo_path, &["add", "-A"], GitOperationKind::Other)
            .await?;
        if !add.ok {
            return Err(GitError::CommandFailed {
                operation: "add".into(),
                repo_path: repo_path.to_path_buf(),
                stderr: add.stderr,
            });
        }

        let commit = self
            .run(
                repo_path,
                &["commit", "-m", message],
                GitOperationKind::Other,
            )
            .await?;
        if !commit.ok {
            return Err(GitError::CommandFailed {
                operation: "commit".into(),
                repo_path: repo_path.to_path_buf(),
                stderr: commit.stderr,
            });
        }

        self.head_sha(repo_path).await.map(Some)
    }

    /// Safety net: commit any uncommitted work with a recovery message and
    /// push the branch. Idempotent: a clean tree yields `None`.
    pub async fn auto_commit_uncommitted_work(
        &self,
        repo_path: &Path,
        story_title: &str,
        branch: &str,
    ) -> Result<Option<String>, GitError> {
        let message = format!("chore: recovered uncommitted work for story: {}", story_title);
        let Some(sha) = self.commit_all(repo_path, &message).await? else {
            return Ok(None);
        };
        self.push(
            repo_path,
            branch,
            PushOpts {
                set_upstream: true,
                ..Default::default()
            },
        )
        .await?;
        Ok(Some(sha))
    }

    // ── Push and remote verification ─────────────────────────────────

    /// Push the branch with retry; after success, fast-forward-pull to keep
    /// local in sync with whatever the remote accepted.
    pub async fn push(
        &self,
        repo_path: &Path,
        branch: &str,
        opts: PushOpts,
    ) -> Result<(), GitError> {
        let mut args: Vec<&str> = vec!["push"];
        if opts.force_with_lease {
            args.push("--force-with-lease");
        }
        if opts.set_upstream {
            args.push("--set-upstream");
        }
        args.push("origin");
        args.push(branch);

        self.run_with_retry(repo_path, &args, GitOperationKind::Push)
            .await?;
        self.pull_ff_only(repo_path).await
    }

    /// `git pull --ff-only`. A failure here is tolerated when the branch has
    /// no upstream yet.
    pub async fn pull_ff_only(&self, repo_path: &Path) -> Result<(), GitError> {
        let result = self
            .run(repo_path, &["pull", "--ff-only"], GitOperationKind::Fetch)
            .await?;
        if !result.ok && !result.stderr.contains("no tracking information") {
            tracing::debug!(stderr = %result.stderr.trim(), "pull --ff-only did not fast-forward");
        }
        Ok(())
    }

    /// Whether the commit is reachable from any remote branch.
    pub async fn verify_commit_on_remote(
        &self,
        repo_path: &Path,
        sha: &str,
    ) -> Result<bool, GitError> {
        let result = self
            .run(
                repo_path,
                &["branch", "-r", "--contains", sha],
                GitOperationKind::Status,
            )
            .await?;
        Ok(result.ok && !result.stdout.trim().is_empty())
    }

    /// Make sure the given commit is on the remote: push, then
    /// force-push-with-lease as a last resort.
    pub async fn ensure_commit_on_remote(
        &self,
        repo_path: &Path,
        branch: &str,
        sha: &str,
    ) -> Result<(), GitError> {
        if self.verify_commit_on_remote(repo_path, sha).await? {
            return Ok(());
        }
        let plain = self
            .push(
                repo_path,
                branch,
                PushOpts {
                    set_upstream: true,
                    ..Default::default()
                },
            )
            .await;
        if plain.is_ok() && self.verify_commit_on_remote(repo_path, sha).await? {
            return Ok(());
        }
        tracing::warn!(%branch, %sha, "plain push did not land commit, force-pushing with lease");
        self.push(
            repo_path,
            branch,
            PushOpts {
                force_with_lease: true,
                set_upstream: true,
            },
        )
        .await
    }

    /// Push the branch if the remote does not have it yet.
    pub async fn ensure_branch_on_remote(
        &self,
        repo_path: &Path,
        branch: &str,
    ) -> Result<(), GitError> {
        let listed = self
            .run_with_retry(
                repo_path,
                &["ls-remote", "--heads", "origin", branch],
                GitOperationKind::Fetch,
            )
            .await?;
        if listed.stdout.trim().is_empty() {
            self.push(
                repo_path,
                branch,
                PushOpts {
                    set_upstream: true,
                    ..Default::default()
                },
            )
            .await?;
        }
        Ok(())
    }

    // ── Merge ────────────────────────────────────────────────────────

    /// Merge `source` into `target` with --no-ff.
    ///
    /// Checks out the target, fast-forward-pulls it, stages any untracked
    /// generator output under a `chore:` commit, then merges. On conflict
    /// the outcome lists the conflicted files and the merge is left open for
    /// resolution (or [`Self::abort_merge`]).
    pub async fn merge(
        &self,
        repo_path: &Path,
        source_branch: &str,
        target_branch: &str,
        message: &str,
    ) -> Result<MergeOutcome, GitError> {
        self.checkout(repo_path, target_branch, None).await?;
        self.pull_ff_only(repo_path).await?;
        self.commit_all(repo_path, "chore: stage generated files before merge")
            .await?;

        let merged = self
            .run(
                repo_path,
                &["merge", "--no-ff", source_branch, "-m", message],
                GitOperationKind::Other,
            )
            .await?;

        if merged.ok {
            let sha = self.head_sha(repo_path).await?;
            return Ok(MergeOutcome {
                ok: true,
                conflicted_files: Vec::new(),
                merge_commit_sha: Some(sha),
            });
        }

        let conflicted = self.conflicted_files(repo_path).await?;
        if conflicted.is_empty() {
            // Not a content conflict; surface the raw failure
            return Err(GitError::CommandFailed {
                operation: "merge".into(),
                repo_path: repo_path.to_path_buf(),
                stderr: merged.stderr,
            });
        }
        Ok(MergeOutcome {
            ok: false,
            conflicted_files: conflicted,
            merge_commit_sha: None,
        })
    }

    /// Files currently in the unmerged state.
    pub async fn conflicted_files(&self, repo_path: &Path) -> Result<Vec<String>, GitError> {
        let result = self
            .run(
                repo_path,
                &["diff", "--name-only", "--diff-filter=U"],
                GitOperationKind::Status,
            )
            .await?;
        Ok(result
            .stdout
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Abort an in-progress merge.
    pub async fn abort_merge(&self, repo_path: &Path) -> Result<(), GitError> {
        let result = self
            .run(repo_path, &["merge", "--abort"], GitOperationKind::Other)
            .await?;
        if result.ok {
            Ok(())
        } else {
            Err(GitError::CommandFailed {
                operation: "merge --abort".into(),
                repo_path: repo_path.to_path_buf(),
                stderr: result.stderr,
            })
        }
    }

    /// Absolute path of a repository inside a workspace directory.
    pub fn repo_path(workspace: &Path, repo_name: &str) -> PathBuf {
        workspace.join(repo_name)
    }
}

fn is_transient(stderr: &str) -> bool {
    TRANSIENT_PATTERN.is_match(stderr)
}

fn retry_delay(attempt: u32) -> Duration {
    let delay = RETRY_BASE.saturating_mul(2u32.saturating_pow(attempt));
    delay.min(RETRY_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_patterns() {
        assert!(is_transient("fatal: unable to access: ECONNRESET"));
        assert!(is_transient("ssh: Could not resolve host: github.com"));
        assert!(is_transient("fatal: early EOF"));
        assert!(is_transient("HTTP 429: rate limit exceeded"));
        assert!(!is_transient("fatal: not a git repository"));
        assert!(!is_transient("error: pathspec 'x' did not match"));
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        assert_eq!(retry_delay(0), Duration::from_secs(2));
        assert_eq!(retry_delay(1), Duration::from_secs(4));
        assert_eq!(retry_delay(4), Duration::from_secs(32));
        assert_eq!(retry_delay(8), Duration::from_secs(60));
    }

    #[test]
    fn test_repo_path_layout() {
        let path = GitGateway::repo_path(Path::new("/work/task-T1"), "api");
        assert_eq!(path, PathBuf::from("/work/task-T1/api"));
    }
}
