use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};

use crate::git::{GitBackend, GitError, GitOutput, require_success};

#[derive(Debug, Clone)]
pub struct CommandGitSettings {
    pub binary: PathBuf,
    /// Upper bound for any single git invocation.
    pub timeout: Duration,
}

impl Default for CommandGitSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Runs the git binary as a subprocess.
#[derive(Debug, Clone, Default)]
pub struct CommandGitBackend {
    settings: CommandGitSettings,
}

impl CommandGitBackend {
    pub fn new(settings: CommandGitSettings) -> Self {
        Self { settings }
    }

    async fn run(
        &self,
        operation: &'static str,
        cwd: &Path,
        args: &[&str],
    ) -> Result<GitOutput, GitError> {
        let mut command = Command::new(&self.settings.binary);
        command
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            target: "git",
            operation,
            cwd = %cwd.display(),
            args = ?args,
            "git_invoke"
        );

        let child = command
            .spawn()
            .map_err(|source| GitError::Spawn { operation, source })?;
        let output = match timeout(self.settings.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => return Err(GitError::Spawn { operation, source }),
            Err(_) => {
                return Err(GitError::Timeout {
                    operation,
                    timeout: self.settings.timeout,
                });
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(GitOutput {
            exit_code: output.status.code(),
            output: text,
        })
    }
}

#[async_trait]
impl GitBackend for CommandGitBackend {
    async fn clone_branch(
        &self,
        url: &str,
        branch: &str,
        destination: &Path,
    ) -> Result<GitOutput, GitError> {
        let parent = destination
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| GitError::Spawn {
                operation: "clone",
                source,
            })?;

        // git runs inside `parent`, so the clone target is named relative to it.
        let directory = destination
            .file_name()
            .ok_or_else(|| GitError::Spawn {
                operation: "clone",
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("clone destination {} has no final component", destination.display()),
                ),
            })?
            .to_string_lossy();
        self.run(
            "clone",
            parent,
            &["clone", "-b", branch, "--single-branch", url, &directory],
        )
        .await
    }

    async fn pull(
        &self,
        workdir: &Path,
        remote: &str,
        branch: &str,
    ) -> Result<GitOutput, GitError> {
        self.run("pull", workdir, &["pull", remote, branch]).await
    }

    async fn stash(&self, workdir: &Path) -> Result<GitOutput, GitError> {
        self.run("stash", workdir, &["stash"]).await
    }

    async fn fetch_and_create_branch(
        &self,
        workdir: &Path,
        remote: &str,
        branch: &str,
    ) -> Result<GitOutput, GitError> {
        let fetch = self.run("fetch", workdir, &["fetch", remote, branch]).await?;
        if !fetch.is_success() {
            return Ok(fetch);
        }

        let checkout = self
            .run("checkout", workdir, &["checkout", "-b", branch, "FETCH_HEAD"])
            .await?;
        Ok(GitOutput {
            exit_code: checkout.exit_code,
            output: format!("{}{}", fetch.output, checkout.output),
        })
    }

    async fn hard_reset(
        &self,
        workdir: &Path,
        remote: &str,
        branch: &str,
    ) -> Result<GitOutput, GitError> {
        let upstream = format!("{remote}/{branch}");
        self.run("reset", workdir, &["reset", "--hard", &upstream])
            .await
    }

    async fn remote_url(&self, workdir: &Path) -> Result<String, GitError> {
        let output = require_success(
            "config",
            self.run(
                "config",
                workdir,
                &["config", "--get", "remote.origin.url"],
            )
            .await,
        )?;
        Ok(output.trimmed().to_string())
    }

    async fn current_branch(&self, workdir: &Path) -> Result<String, GitError> {
        let output = require_success(
            "symbolic-ref",
            self.run("symbolic-ref", workdir, &["symbolic-ref", "--short", "HEAD"])
                .await,
        )?;
        Ok(output.trimmed().to_string())
    }
}
