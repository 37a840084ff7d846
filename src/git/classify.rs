use crate::git::{GitError, GitOutput};

/// Markers after which discarding local divergence is the accepted fix.
const CONFLICT_MARKERS: &[&str] = &[
    "Merge conflict",
    "CONFLICT (",
    "refusing to merge unrelated histories",
    "commit your changes or stash them before you merge",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "Could not resolve host",
    "unable to access",
    "Connection timed out",
    "Connection refused",
    "early EOF",
    "the remote end hung up",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    Success,
    TransientFailure,
    ConflictRecoverable,
    UnknownFailure,
}

impl PullOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PullOutcome::Success => "success",
            PullOutcome::TransientFailure => "transient_failure",
            PullOutcome::ConflictRecoverable => "conflict_recoverable",
            PullOutcome::UnknownFailure => "unknown_failure",
        }
    }
}

pub fn classify_pull(result: &Result<GitOutput, GitError>) -> PullOutcome {
    match result {
        Ok(output) if output.is_success() => PullOutcome::Success,
        Ok(output) => classify_failure_text(&output.output),
        Err(GitError::Timeout { .. }) => PullOutcome::TransientFailure,
        Err(GitError::Failed { output, .. }) => classify_failure_text(output),
        Err(GitError::Spawn { .. }) => PullOutcome::UnknownFailure,
    }
}

fn classify_failure_text(output: &str) -> PullOutcome {
    if CONFLICT_MARKERS.iter().any(|marker| output.contains(marker)) {
        PullOutcome::ConflictRecoverable
    } else if TRANSIENT_MARKERS.iter().any(|marker| output.contains(marker)) {
        PullOutcome::TransientFailure
    } else {
        PullOutcome::UnknownFailure
    }
}
