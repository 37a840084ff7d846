use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    git::{GitBackend, GitError, GitOutput, ORIGIN, PullOutcome, classify_pull, require_success},
    intent::DeploymentIntent,
    queue::CoalescingQueue,
};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Directory holding one checkout per deployment target.
    pub root_dir: PathBuf,
    pub interval: Duration,
}

/// Which git state transition a target needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    FreshCheckout,
    Reclone,
    SwitchBranch,
    Pull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    Cloned,
    CloneFailed { output: String },
    Pulled,
    ConflictRecovered,
    PullFailed { outcome: PullOutcome, output: String },
    RecoveryFailed { output: String },
}

impl Convergence {
    pub fn is_converged(&self) -> bool {
        matches!(
            self,
            Convergence::Cloned | Convergence::Pulled | Convergence::ConflictRecovered
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub transition: Transition,
    pub convergence: Convergence,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to inspect {}: {source}", path.display())]
    Inspect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to remove stale checkout {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("branch switch failed in {}: {source}", path.display())]
    BranchSwitch {
        path: PathBuf,
        #[source]
        source: GitError,
    },
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub cycle_id: u64,
    pub targets: BTreeMap<String, Result<TargetReport, ReconcileError>>,
}

impl CycleReport {
    pub fn converged(&self) -> usize {
        self.targets
            .values()
            .filter(|result| matches!(result, Ok(report) if report.convergence.is_converged()))
            .count()
    }
}

pub struct Reconciler {
    settings: ReconcilerSettings,
    backend: Arc<dyn GitBackend>,
    queue: CoalescingQueue,
    cycle_id: u64,
}

impl Reconciler {
    pub fn new(
        settings: ReconcilerSettings,
        backend: Arc<dyn GitBackend>,
        queue: CoalescingQueue,
    ) -> Self {
        Self {
            settings,
            backend,
            queue,
            cycle_id: 0,
        }
    }

    /// Drains and applies the queue every interval until `shutdown` fires.
    /// A cycle in progress always finishes before the loop observes shutdown.
    #[tracing::instrument(name = "reconciler_run", target = "reconciler", skip_all)]
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            target: "reconciler",
            root_dir = %self.settings.root_dir.display(),
            interval_ms = self.settings.interval.as_millis() as u64,
            "reconciler_started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
            }
        }

        tracing::info!(target: "reconciler", cycles = self.cycle_id, "reconciler_stopped");
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle_id = self.cycle_id.saturating_add(1);
        let pending = self.queue.drain_all();
        let mut report = CycleReport {
            cycle_id: self.cycle_id,
            targets: BTreeMap::new(),
        };
        if pending.is_empty() {
            return report;
        }

        tracing::info!(
            target: "reconciler",
            cycle_id = self.cycle_id,
            pending = pending.len(),
            "reconcile_cycle_started"
        );

        for (target_path, intent) in pending {
            let result = self.reconcile_target(&intent).await;
            if let Err(err) = &result {
                tracing::warn!(
                    target: "reconciler",
                    cycle_id = self.cycle_id,
                    target_path = %target_path,
                    error = %err,
                    "target_reconcile_failed"
                );
            }
            report.targets.insert(target_path, result);
        }

        tracing::info!(
            target: "reconciler",
            cycle_id = self.cycle_id,
            targets = report.targets.len(),
            converged = report.converged(),
            "reconcile_cycle_finished"
        );
        report
    }

    #[tracing::instrument(
        name = "reconcile_target",
        target = "reconciler",
        skip_all,
        fields(target_path = %intent.target_path(), branch = %intent.branch())
    )]
    pub async fn reconcile_target(
        &self,
        intent: &DeploymentIntent,
    ) -> Result<TargetReport, ReconcileError> {
        let workdir = self.settings.root_dir.join(intent.target_path());
        tracing::info!(
            target: "reconciler",
            path = %workdir.display(),
            source = %intent.source_url(),
            committer = %intent.committer(),
            "deploy_requested"
        );

        if !is_dir(&workdir).await? {
            tracing::info!(target: "reconciler", path = %workdir.display(), "new_target_fresh_checkout");
            return Ok(TargetReport {
                transition: Transition::FreshCheckout,
                convergence: self.fresh_checkout(intent, &workdir).await,
            });
        }

        let recorded = match self.backend.remote_url(&workdir).await {
            Ok(url) => self
                .backend
                .current_branch(&workdir)
                .await
                .map(|branch| (url, branch)),
            Err(err) => Err(err),
        };

        let (recorded_url, recorded_branch) = match recorded {
            Ok(recorded) => recorded,
            Err(err) => {
                tracing::warn!(
                    target: "reconciler",
                    path = %workdir.display(),
                    error = %err,
                    "origin_unknown_clobbering"
                );
                return self.reclone(intent, &workdir).await;
            }
        };

        if recorded_url != intent.source_url() {
            tracing::info!(
                target: "reconciler",
                path = %workdir.display(),
                recorded_source = %recorded_url,
                source = %intent.source_url(),
                "source_mismatch_clobbering"
            );
            return self.reclone(intent, &workdir).await;
        }

        if recorded_branch != intent.branch() {
            tracing::info!(
                target: "reconciler",
                path = %workdir.display(),
                recorded_branch = %recorded_branch,
                "branch_mismatch_switching"
            );
            self.switch_branch(&workdir, intent.branch()).await?;
            return Ok(TargetReport {
                transition: Transition::SwitchBranch,
                convergence: self.pull_with_recovery(&workdir, intent.branch()).await,
            });
        }

        tracing::debug!(target: "reconciler", path = %workdir.display(), "source_and_branch_match");
        Ok(TargetReport {
            transition: Transition::Pull,
            convergence: self.pull_with_recovery(&workdir, intent.branch()).await,
        })
    }

    async fn reclone(
        &self,
        intent: &DeploymentIntent,
        workdir: &Path,
    ) -> Result<TargetReport, ReconcileError> {
        tracing::info!(target: "reconciler", path = %workdir.display(), "recursive_delete");
        tokio::fs::remove_dir_all(workdir)
            .await
            .map_err(|source| ReconcileError::Remove {
                path: workdir.to_path_buf(),
                source,
            })?;

        Ok(TargetReport {
            transition: Transition::Reclone,
            convergence: self.fresh_checkout(intent, workdir).await,
        })
    }

    async fn fresh_checkout(&self, intent: &DeploymentIntent, workdir: &Path) -> Convergence {
        let result = self
            .backend
            .clone_branch(intent.source_url(), intent.branch(), workdir)
            .await;

        match result {
            Ok(output) if output.is_success() => {
                tracing::info!(
                    target: "reconciler",
                    path = %workdir.display(),
                    source = %intent.source_url(),
                    branch = %intent.branch(),
                    "checkout_completed"
                );
                Convergence::Cloned
            }
            other => {
                let output = describe(&other);
                tracing::warn!(
                    target: "reconciler",
                    path = %workdir.display(),
                    source = %intent.source_url(),
                    output = %output,
                    "checkout_failed"
                );
                Convergence::CloneFailed { output }
            }
        }
    }

    async fn switch_branch(&self, workdir: &Path, branch: &str) -> Result<(), ReconcileError> {
        let switch_error = |source| ReconcileError::BranchSwitch {
            path: workdir.to_path_buf(),
            source,
        };

        require_success("stash", self.backend.stash(workdir).await).map_err(switch_error)?;
        require_success(
            "fetch",
            self.backend
                .fetch_and_create_branch(workdir, ORIGIN, branch)
                .await,
        )
        .map_err(switch_error)?;
        Ok(())
    }

    async fn pull_with_recovery(&self, workdir: &Path, branch: &str) -> Convergence {
        let result = self.backend.pull(workdir, ORIGIN, branch).await;
        let outcome = classify_pull(&result);

        match outcome {
            PullOutcome::Success => {
                tracing::info!(target: "reconciler", path = %workdir.display(), "pull_completed");
                Convergence::Pulled
            }
            PullOutcome::ConflictRecoverable => {
                tracing::info!(
                    target: "reconciler",
                    path = %workdir.display(),
                    output = %describe(&result),
                    "pull_conflict_resetting"
                );
                let reset = self.backend.hard_reset(workdir, ORIGIN, branch).await;
                match reset {
                    Ok(output) if output.is_success() => {
                        tracing::info!(
                            target: "reconciler",
                            path = %workdir.display(),
                            upstream = %format!("{ORIGIN}/{branch}"),
                            "pull_conflict_recovered"
                        );
                        Convergence::ConflictRecovered
                    }
                    other => {
                        let output = describe(&other);
                        tracing::warn!(
                            target: "reconciler",
                            path = %workdir.display(),
                            output = %output,
                            "hard_reset_failed_giving_up"
                        );
                        Convergence::RecoveryFailed { output }
                    }
                }
            }
            PullOutcome::TransientFailure | PullOutcome::UnknownFailure => {
                let output = describe(&result);
                tracing::warn!(
                    target: "reconciler",
                    path = %workdir.display(),
                    outcome = outcome.as_str(),
                    output = %output,
                    "pull_failed"
                );
                Convergence::PullFailed { outcome, output }
            }
        }
    }
}

async fn is_dir(path: &Path) -> Result<bool, ReconcileError> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.is_dir()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(source) => Err(ReconcileError::Inspect {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn describe(result: &Result<GitOutput, GitError>) -> String {
    match result {
        Ok(output) => output.trimmed().to_string(),
        Err(err) => err.to_string(),
    }
}
