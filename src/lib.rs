// For integration tests only, staged ships as a binary
pub mod cli;
pub mod config;
pub mod git;
pub mod intent;
pub mod logging;
pub mod queue;
pub mod reconciler;
pub mod stream;
