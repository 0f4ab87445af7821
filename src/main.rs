#![forbid(unsafe_code)]

//! `reloader`: rerun a command whenever watched files change.
//!
//! Loads configuration, starts the file notifier and drives the restart loop
//! until Ctrl-C or SIGTERM. Exits non-zero only when the loop ends with an error.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use reloader::config::{ConfigOverrides, ReloaderConfig, Settings};
use reloader::models::outcome::SignalKind;
use reloader::notifier::FileNotifier;
use reloader::orchestrator::controller::ExecutionController;
use reloader::orchestrator::restart::{FailurePolicy, RestartOrchestrator};
use reloader::process::OsRunnableFactory;
use reloader::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "reloader", about = "Restart a command when files change", version, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// The main command to run (required unless set in the config file).
    #[arg(long)]
    cmd: Option<String>,

    /// Command to run before each start of the main command. Repeatable.
    #[arg(long)]
    before: Vec<String>,

    /// Command to run after each stop of the main command. Repeatable.
    #[arg(long)]
    after: Vec<String>,

    /// Space separated file patterns to watch, e.g. 'src/*.rs Cargo.toml'.
    #[arg(long)]
    patterns: Option<String>,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Seconds to wait after the stop signal before killing.
    #[arg(long)]
    grace_period: Option<u64>,

    /// Seconds a before/after command may run.
    #[arg(long)]
    hook_timeout: Option<u64>,

    /// What to do when the command exits on its own or fails to restart.
    #[arg(long, value_enum)]
    on_failure: Option<FailurePolicy>,

    /// Signal used to ask the command to stop.
    #[arg(long, value_enum)]
    stop_signal: Option<SignalKind>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            command: self.cmd.clone(),
            before: self.before.clone(),
            after: self.after.clone(),
            patterns: self.patterns.clone(),
            log_level: self.log_level.clone(),
            grace_period_seconds: self.grace_period,
            hook_timeout_seconds: self.hook_timeout,
            on_failure: self.on_failure,
            stop_signal: self.stop_signal,
        }
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let mut config = match &args.config {
        Some(path) => ReloaderConfig::load_from_path(path)?,
        None => ReloaderConfig::default(),
    };
    config.apply_overrides(args.overrides())?;
    let settings = config.resolve()?;

    init_tracing(&settings.log_level, args.log_format)?;
    info!(command = %settings.session.main_command, "reloader bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(settings))
}

async fn run(settings: Settings) -> Result<()> {
    let ct = CancellationToken::new();

    // ── Forward shutdown signals into the cancellation scope ──
    let signal_ct = ct.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received, stopping");
        signal_ct.cancel();
    });

    // ── Start watching files ────────────────────────────
    let (event_tx, event_rx) = mpsc::channel(64);
    let (error_tx, error_rx) = mpsc::channel(16);
    let notifier = FileNotifier::start(settings.patterns, event_tx, error_tx)?;
    info!(patterns = notifier.patterns().len(), "file notifier started");

    // ── Run the restart loop ────────────────────────────
    let controller = ExecutionController::new(
        settings.session,
        Arc::new(OsRunnableFactory),
        settings.options,
    );
    let orchestrator = RestartOrchestrator::new(controller, settings.on_failure);
    let result = orchestrator.run(event_rx, error_rx, ct).await;

    drop(notifier);

    match &result {
        Ok(()) => info!("reloader shut down"),
        Err(err) => error!(%err, "reloader stopped with an error"),
    }
    result
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                if let Err(err) = ctrl_c.await {
                    error!(%err, "ctrl-c signal handler failed");
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
            std::future::pending::<()>().await;
        }
    }
}

fn init_tracing(level: &str, log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
