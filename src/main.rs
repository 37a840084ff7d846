use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use staged::{
    cli::args_from_env,
    config::Config,
    git::CommandGitBackend,
    logging::init_tracing,
    queue::CoalescingQueue,
    reconciler::Reconciler,
    stream::StreamConsumer,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = args_from_env()?;
    let config = Config::load(&args.config_path)
        .with_context(|| format!("failed to load config from {}", args.config_path.display()))?;
    let logging_guard = init_tracing(&config.logging, args.debug)?;

    let policy = config.intent_policy();
    tracing::info!(
        target: "staged",
        run_id = %logging_guard.run_id(),
        mode = policy.mode.record_key(),
        root_dir = %config.deploy.root_dir.display(),
        stream_url = %config.stream.url,
        "staged_starting"
    );

    let queue = CoalescingQueue::new();
    let consumer = StreamConsumer::new(config.stream_settings(), policy, queue.clone())
        .context("failed to construct stream consumer")?;
    let reconciler = Reconciler::new(
        config.reconciler_settings(),
        Arc::new(CommandGitBackend::new(config.git_settings())),
        queue,
    );

    let shutdown = CancellationToken::new();
    let consumer_task = tokio::spawn(consumer.run(shutdown.clone()));
    let reconciler_task = tokio::spawn(reconciler.run(shutdown.clone()));

    let mut sigint =
        signal(SignalKind::interrupt()).context("unable to listen for SIGINT (Ctrl+C)")?;
    let mut sigterm = signal(SignalKind::terminate()).context("unable to listen for SIGTERM")?;

    let signal_name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    };

    tracing::info!(target: "staged", signal = signal_name, "shutdown_requested");
    shutdown.cancel();
    consumer_task.await.context("stream consumer task join failed")?;
    reconciler_task
        .await
        .context("reconciler task join failed")?;

    tracing::info!(
        target: "staged",
        run_id = %logging_guard.run_id(),
        signal = signal_name,
        "staged_stopped"
    );
    Ok(())
}
