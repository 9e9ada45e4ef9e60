use std::path::Path;

use anyhow::{Context, Result};
use git2::{Repository, StatusOptions};
use serde::{Deserialize, Serialize};

/// Classification of uncommitted state in a working tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceDetection {
    pub has_uncommitted_files: bool,
    pub has_untracked_files: bool,
    pub uncommitted: Vec<String>,
    pub untracked: Vec<String>,
}

impl WorkspaceDetection {
    pub fn has_any_work(&self) -> bool {
        self.has_uncommitted_files || self.has_untracked_files
    }
}

/// What `git log` says about a developer's branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeveloperWork {
    pub has_commits: bool,
    pub commit_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
}

/// Inspect `git status --porcelain` equivalent state, classifying modified
/// vs untracked files.
pub fn detect_work_in_workspace(repo_path: &Path) -> Result<WorkspaceDetection> {
    let repo = Repository::open(repo_path).context("Failed to open git repository")?;

    let mut opts = StatusOptions::new();
    opts.include_untracked(true).recurse_untracked_dirs(true);
    let statuses = repo
        .statuses(Some(&mut opts))
        .context("Failed to read repository status")?;

    let mut detection = WorkspaceDetection::default();
    for entry in statuses.iter() {
        let Some(path) = entry.path() else { continue };
        let status = entry.status();
        if status.is_wt_new() {
            detection.untracked.push(path.to_string());
        } else if status.is_wt_modified()
            || status.is_wt_deleted()
            || status.is_index_new()
            || status.is_index_modified()
            || status.is_index_deleted()
        {
            detection.uncommitted.push(path.to_string());
        }
    }
    detection.has_uncommitted_files = !detection.uncommitted.is_empty();
    detection.has_untracked_files = !detection.untracked.is_empty();
    Ok(detection)
}

/// Report the commits on `branch`, excluding history reachable from
/// `base_ref` when one is given (the epic branch, typically).
///
/// Prefers the local branch; falls back to `origin/<branch>`. A missing
/// branch yields an empty report rather than an error, because "no work" is
/// an answer the callers act on.
pub fn verify_developer_work(
    repo_path: &Path,
    branch: &str,
    base_ref: Option<&str>,
) -> Result<DeveloperWork> {
    let repo = Repository::open(repo_path).context("Failed to open git repository")?;

    let Some(tip) = resolve_branch_tip(&repo, branch) else {
        return Ok(DeveloperWork::default());
    };

    let mut walk = repo.revwalk().context("Failed to start revwalk")?;
    walk.push(tip).context("Failed to push branch tip")?;
    if let Some(base) = base_ref
        && let Some(base_tip) = resolve_branch_tip(&repo, base)
    {
        // Hiding an unrelated base is fine; the walk just yields everything.
        let _ = walk.hide(base_tip);
    }

    let mut count = 0usize;
    let mut latest: Option<git2::Oid> = None;
    for oid in walk.flatten() {
        if latest.is_none() {
            latest = Some(oid);
        }
        count += 1;
    }

    let (commit_sha, commit_message) = match latest {
        Some(oid) => {
            let commit = repo.find_commit(oid).context("Failed to load commit")?;
            (
                Some(oid.to_string()),
                commit.summary().map(|s| s.to_string()),
            )
        }
        None => (None, None),
    };

    Ok(DeveloperWork {
        has_commits: count > 0,
        commit_count: count,
        commit_sha,
        commit_message,
    })
}

/// Tip commit of a branch, trying local then remote-tracking names.
fn resolve_branch_tip(repo: &Repository, branch: &str) -> Option<git2::Oid> {
    for candidate in [
        format!("refs/heads/{}", branch),
        format!("refs/remotes/origin/{}", branch),
        branch.to_string(),
    ] {
        if let Ok(reference) = repo.revparse_single(&candidate) {
            if let Some(commit) = reference.as_commit() {
                return Some(commit.id());
            }
            if let Ok(commit) = reference.peel_to_commit() {
                return Some(commit.id());
            }
        }
    }
    None
}

/// HEAD SHA of the repository, or None on an unborn branch.
pub fn head_sha(repo_path: &Path) -> Option<String> {
    let repo = Repository::open(repo_path).ok()?;
    repo.head()
        .ok()
        .and_then(|head| head.peel_to_commit().ok())
        .map(|c| c.id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (tempfile::TempDir, Repository) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        (dir, repo)
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) -> String {
        let repo = Repository::open(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        let id = if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap()
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap()
        };
        id.to_string()
    }

    #[test]
    fn test_detect_clean_tree() {
        let (dir, _repo) = setup_repo();
        commit_file(dir.path(), "a.txt", "hello", "init");
        let detection = detect_work_in_workspace(dir.path()).unwrap();
        assert!(!detection.has_any_work());
    }

    #[test]
    fn test_detect_untracked_file() {
        let (dir, _repo) = setup_repo();
        commit_file(dir.path(), "a.txt", "hello", "init");
        fs::write(dir.path().join("new.rs"), "fn main() {}").unwrap();
        let detection = detect_work_in_workspace(dir.path()).unwrap();
        assert!(detection.has_untracked_files);
        assert!(!detection.has_uncommitted_files);
        assert_eq!(detection.untracked, vec!["new.rs"]);
    }

    #[test]
    fn test_detect_modified_file() {
        let (dir, _repo) = setup_repo();
        commit_file(dir.path(), "a.txt", "one\n", "init");
        fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        let detection = detect_work_in_workspace(dir.path()).unwrap();
        assert!(detection.has_uncommitted_files);
        assert_eq!(detection.uncommitted, vec!["a.txt"]);
    }

    #[test]
    fn test_verify_developer_work_missing_branch() {
        let (dir, _repo) = setup_repo();
        commit_file(dir.path(), "a.txt", "hello", "init");
        let work = verify_developer_work(dir.path(), "story/none", None).unwrap();
        assert!(!work.has_commits);
        assert_eq!(work.commit_count, 0);
        assert!(work.commit_sha.is_none());
    }

    #[test]
    fn test_verify_developer_work_counts_branch_commits() {
        let (dir, repo) = setup_repo();
        commit_file(dir.path(), "base.txt", "base", "base commit");
        let base_branch = repo.head().unwrap().shorthand().unwrap().to_string();
        let base = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("story/S1-001", &base, false).unwrap();
        repo.set_head("refs/heads/story/S1-001").unwrap();

        let c1 = commit_file(dir.path(), "feat.txt", "feature", "add feature");
        let work = verify_developer_work(dir.path(), "story/S1-001", Some(&base_branch)).unwrap();
        assert!(work.has_commits);
        assert_eq!(work.commit_count, 1);
        assert_eq!(work.commit_sha, Some(c1));
        assert_eq!(work.commit_message.as_deref(), Some("add feature"));
    }

    #[test]
    fn test_verify_developer_work_no_new_commits_beyond_base() {
        let (dir, repo) = setup_repo();
        commit_file(dir.path(), "base.txt", "base", "base commit");
        let base_branch = repo.head().unwrap().shorthand().unwrap().to_string();
        let base = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("story/S1-002", &base, false).unwrap();

        let work = verify_developer_work(dir.path(), "story/S1-002", Some(&base_branch)).unwrap();
        assert!(!work.has_commits);
    }

    #[test]
    fn test_head_sha() {
        let (dir, _repo) = setup_repo();
        assert!(head_sha(dir.path()).is_none());
        let sha = commit_file(dir.path(), "a.txt", "x", "init");
        assert_eq!(head_sha(dir.path()), Some(sha));
    }
}
