use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use super::{ExecOutcome, SandboxDescriptor, SandboxGateway};

/// Runs sandbox commands as local subprocesses.
///
/// Isolation here is only a working directory; the production deployment
/// swaps in the container-backed gateway. Each task gets a stable descriptor
/// the first time it executes something.
#[derive(Default)]
pub struct ProcessSandbox {
    descriptors: Mutex<HashMap<String, SandboxDescriptor>>,
}

impl ProcessSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn descriptor_for(&self, task_id: &str) -> SandboxDescriptor {
        let mut descriptors = self
            .descriptors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        descriptors
            .entry(task_id.to_string())
            .or_insert_with(|| SandboxDescriptor {
                sandbox_id: format!("local-{}", uuid::Uuid::new_v4()),
                task_id: task_id.to_string(),
            })
            .clone()
    }
}

#[async_trait]
impl SandboxGateway for ProcessSandbox {
    async fn exec(
        &self,
        task_id: &str,
        command: &str,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<ExecOutcome> {
        self.descriptor_for(task_id);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .with_context(|| format!("Sandbox command timed out after {:?}", timeout))?
            .context("Failed to spawn sandbox command")?;

        Ok(ExecOutcome {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn sandbox(&self, task_id: &str) -> Option<SandboxDescriptor> {
        let descriptors = self
            .descriptors
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        descriptors.get(task_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exec_captures_output_and_exit_code() {
        let sandbox = ProcessSandbox::new();
        let outcome = sandbox
            .exec("T1", "echo hello", Path::new("."), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_exec_nonzero_exit() {
        let sandbox = ProcessSandbox::new();
        let outcome = sandbox
            .exec("T1", "exit 3", Path::new("."), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn test_exec_timeout() {
        let sandbox = ProcessSandbox::new();
        let result = sandbox
            .exec("T1", "sleep 5", Path::new("."), Duration::from_millis(100))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_descriptor_is_stable_per_task() {
        let sandbox = ProcessSandbox::new();
        assert!(sandbox.sandbox("T1").await.is_none());
        sandbox
            .exec("T1", "true", Path::new("."), Duration::from_secs(5))
            .await
            .unwrap();
        let a = sandbox.sandbox("T1").await.unwrap();
        sandbox
            .exec("T1", "true", Path::new("."), Duration::from_secs(5))
            .await
            .unwrap();
        let b = sandbox.sandbox("T1").await.unwrap();
        assert_eq!(a.sandbox_id, b.sandbox_id);
    }
}
