use std::{path::Path, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

pub const ORIGIN: &str = "origin";

/// Exit status plus interleaved stdout/stderr of one git invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub exit_code: Option<i32>,
    pub output: String,
}

impl GitOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            output: output.into(),
        }
    }

    pub fn failure(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            output: output.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Output with surrounding whitespace removed, for single-value reads.
    pub fn trimmed(&self) -> &str {
        self.output.trim()
    }
}

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to spawn git {operation}: {source}")]
    Spawn {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("git {operation} did not finish within {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("git {operation} exited with {exit_code:?}: {output}")]
    Failed {
        operation: &'static str,
        exit_code: Option<i32>,
        output: String,
    },
}

impl GitError {
    /// Captured process output, when the process ran at all.
    pub fn output(&self) -> Option<&str> {
        match self {
            GitError::Failed { output, .. } => Some(output),
            GitError::Spawn { .. } | GitError::Timeout { .. } => None,
        }
    }
}

/// The version-control operations the reconciler drives. Every call is
/// synchronous from the caller's view and runs inside `workdir` unless noted.
#[async_trait]
pub trait GitBackend: Send + Sync {
    /// Single-branch clone of `url` at `branch` into `destination`.
    async fn clone_branch(
        &self,
        url: &str,
        branch: &str,
        destination: &Path,
    ) -> Result<GitOutput, GitError>;

    async fn pull(&self, workdir: &Path, remote: &str, branch: &str)
    -> Result<GitOutput, GitError>;

    async fn stash(&self, workdir: &Path) -> Result<GitOutput, GitError>;

    /// Fetches `branch` from `remote` and checks it out as a new local branch.
    async fn fetch_and_create_branch(
        &self,
        workdir: &Path,
        remote: &str,
        branch: &str,
    ) -> Result<GitOutput, GitError>;

    async fn hard_reset(
        &self,
        workdir: &Path,
        remote: &str,
        branch: &str,
    ) -> Result<GitOutput, GitError>;

    async fn remote_url(&self, workdir: &Path) -> Result<String, GitError>;

    async fn current_branch(&self, workdir: &Path) -> Result<String, GitError>;
}

/// Turns a non-zero exit into `GitError::Failed` for steps that must succeed.
pub(crate) fn require_success(
    operation: &'static str,
    result: Result<GitOutput, GitError>,
) -> Result<GitOutput, GitError> {
    let output = result?;
    if output.is_success() {
        return Ok(output);
    }
    Err(GitError::Failed {
        operation,
        exit_code: output.exit_code,
        output: output.output,
    })
}
