use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use crate::git::{GitBackend, GitError, GitOutput};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitCall {
    Clone {
        url: String,
        branch: String,
        destination: PathBuf,
    },
    Pull {
        workdir: PathBuf,
        remote: String,
        branch: String,
    },
    Stash {
        workdir: PathBuf,
    },
    FetchAndCreateBranch {
        workdir: PathBuf,
        remote: String,
        branch: String,
    },
    HardReset {
        workdir: PathBuf,
        remote: String,
        branch: String,
    },
    RemoteUrl {
        workdir: PathBuf,
    },
    CurrentBranch {
        workdir: PathBuf,
    },
}

impl GitCall {
    pub fn is_introspection(&self) -> bool {
        matches!(self, GitCall::RemoteUrl { .. } | GitCall::CurrentBranch { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCheckout {
    pub url: String,
    pub branch: String,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<GitCall>,
    checkouts: BTreeMap<PathBuf, FakeCheckout>,
    failing_clone_urls: BTreeSet<String>,
    broken_introspection: BTreeSet<PathBuf>,
    pull_responses: VecDeque<GitOutput>,
    reset_responses: VecDeque<GitOutput>,
    fetch_response: Option<GitOutput>,
}

/// In-memory git stand-in. Clones create the destination directory on disk so
/// filesystem checks in the reconciler see the same layout as with real git.
#[derive(Default)]
pub struct FakeGitBackend {
    state: Mutex<FakeState>,
}

impl FakeGitBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates `path` on disk as an existing checkout of `url` at `branch`.
    pub fn seed_checkout(&self, path: &Path, url: &str, branch: &str) {
        let _ = fs::create_dir_all(path);
        self.lock().checkouts.insert(
            path.to_path_buf(),
            FakeCheckout {
                url: url.to_string(),
                branch: branch.to_string(),
            },
        );
    }

    pub fn fail_clones_of(&self, url: &str) {
        self.lock().failing_clone_urls.insert(url.to_string());
    }

    pub fn break_introspection(&self, path: &Path) {
        self.lock().broken_introspection.insert(path.to_path_buf());
    }

    /// Queues the result of the next `pull`; unqueued pulls succeed.
    pub fn push_pull_response(&self, output: GitOutput) {
        self.lock().pull_responses.push_back(output);
    }

    pub fn push_reset_response(&self, output: GitOutput) {
        self.lock().reset_responses.push_back(output);
    }

    pub fn set_fetch_response(&self, output: GitOutput) {
        self.lock().fetch_response = Some(output);
    }

    pub fn checkout(&self, path: &Path) -> Option<FakeCheckout> {
        self.lock().checkouts.get(path).cloned()
    }

    pub fn calls(&self) -> Vec<GitCall> {
        self.lock().calls.clone()
    }

    /// Calls other than origin/branch reads.
    pub fn actions(&self) -> Vec<GitCall> {
        self.lock()
            .calls
            .iter()
            .filter(|call| !call.is_introspection())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn introspect<T>(
        &self,
        operation: &'static str,
        workdir: &Path,
        read: impl FnOnce(&FakeCheckout) -> T,
    ) -> Result<T, GitError> {
        let state = self.lock();
        let checkout = state
            .checkouts
            .get(workdir)
            .filter(|_| !state.broken_introspection.contains(workdir));
        match checkout {
            Some(checkout) => Ok(read(checkout)),
            None => Err(GitError::Failed {
                operation,
                exit_code: Some(128),
                output: "fatal: not a git repository (or any of the parent directories): .git"
                    .to_string(),
            }),
        }
    }
}

#[async_trait]
impl GitBackend for FakeGitBackend {
    async fn clone_branch(
        &self,
        url: &str,
        branch: &str,
        destination: &Path,
    ) -> Result<GitOutput, GitError> {
        let mut state = self.lock();
        state.calls.push(GitCall::Clone {
            url: url.to_string(),
            branch: branch.to_string(),
            destination: destination.to_path_buf(),
        });

        if state.failing_clone_urls.contains(url) {
            return Ok(GitOutput::failure(
                128,
                format!("fatal: repository '{url}' not found"),
            ));
        }

        if let Err(source) = fs::create_dir_all(destination) {
            return Err(GitError::Spawn {
                operation: "clone",
                source,
            });
        }
        state.checkouts.insert(
            destination.to_path_buf(),
            FakeCheckout {
                url: url.to_string(),
                branch: branch.to_string(),
            },
        );
        Ok(GitOutput::success(format!(
            "Cloning into '{}'...",
            destination.display()
        )))
    }

    async fn pull(
        &self,
        workdir: &Path,
        remote: &str,
        branch: &str,
    ) -> Result<GitOutput, GitError> {
        let mut state = self.lock();
        state.calls.push(GitCall::Pull {
            workdir: workdir.to_path_buf(),
            remote: remote.to_string(),
            branch: branch.to_string(),
        });
        Ok(state
            .pull_responses
            .pop_front()
            .unwrap_or_else(|| GitOutput::success("Already up to date.")))
    }

    async fn stash(&self, workdir: &Path) -> Result<GitOutput, GitError> {
        self.lock().calls.push(GitCall::Stash {
            workdir: workdir.to_path_buf(),
        });
        Ok(GitOutput::success("No local changes to save"))
    }

    async fn fetch_and_create_branch(
        &self,
        workdir: &Path,
        remote: &str,
        branch: &str,
    ) -> Result<GitOutput, GitError> {
        let mut state = self.lock();
        state.calls.push(GitCall::FetchAndCreateBranch {
            workdir: workdir.to_path_buf(),
            remote: remote.to_string(),
            branch: branch.to_string(),
        });

        if let Some(response) = state.fetch_response.clone() {
            return Ok(response);
        }
        if let Some(checkout) = state.checkouts.get_mut(workdir) {
            checkout.branch = branch.to_string();
        }
        Ok(GitOutput::success(format!(
            "Switched to a new branch '{branch}'"
        )))
    }

    async fn hard_reset(
        &self,
        workdir: &Path,
        remote: &str,
        branch: &str,
    ) -> Result<GitOutput, GitError> {
        let mut state = self.lock();
        state.calls.push(GitCall::HardReset {
            workdir: workdir.to_path_buf(),
            remote: remote.to_string(),
            branch: branch.to_string(),
        });
        Ok(state
            .reset_responses
            .pop_front()
            .unwrap_or_else(|| GitOutput::success("HEAD is now at 0000000")))
    }

    async fn remote_url(&self, workdir: &Path) -> Result<String, GitError> {
        self.lock().calls.push(GitCall::RemoteUrl {
            workdir: workdir.to_path_buf(),
        });
        self.introspect("config", workdir, |checkout| checkout.url.clone())
    }

    async fn current_branch(&self, workdir: &Path) -> Result<String, GitError> {
        self.lock().calls.push(GitCall::CurrentBranch {
            workdir: workdir.to_path_buf(),
        });
        self.introspect("symbolic-ref", workdir, |checkout| checkout.branch.clone())
    }
}
