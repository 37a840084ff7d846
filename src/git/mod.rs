mod backend;
mod classify;
mod command;
pub mod testing;

pub(crate) use backend::require_success;
pub use backend::{GitBackend, GitError, GitOutput, ORIGIN};
pub use classify::{PullOutcome, classify_pull};
pub use command::{CommandGitBackend, CommandGitSettings};
