//! Restart loop: stop the current session, start the next one.
//!
//! [`RestartOrchestrator::run`] is the only owner of the current session.
//! It handles one input at a time (cancellation, unexpected exit, file
//! change, watch error), so a restart never overlaps the previous
//! session's teardown.

use std::future::Future;
use std::pin::Pin;

use clap::ValueEnum;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::models::event::ChangeEvent;
use crate::models::outcome::ExitOutcome;
use crate::orchestrator::controller::{ExecutionController, Session};
use crate::{AppError, Result};

/// Starts sessions for the orchestrator.
pub trait SessionLauncher: Send + Sync {
    /// Start a session whose main command lives under `scope`.
    ///
    /// # Errors
    ///
    /// Returns the hook or spawn error that prevented the session.
    fn launch(
        &self,
        scope: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + '_>>;
}

impl SessionLauncher for ExecutionController {
    fn launch(
        &self,
        scope: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Session>> + Send + '_>> {
        Box::pin(async move { self.start(&scope).await })
    }
}

/// What happens when the main command is not running through no request of
/// ours: it exited on its own, or a restart failed to start it.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log it and restart on the next file change.
    #[default]
    Wait,
    /// End the loop. A clean `exit 0` ends it successfully.
    Exit,
}

enum Step {
    Shutdown,
    Exited(ExitOutcome),
    Changed(ChangeEvent),
    WatchError(AppError),
    EventsClosed,
    ErrorsClosed,
}

/// Serializes stop/start cycles for a [`SessionLauncher`].
pub struct RestartOrchestrator<L> {
    launcher: L,
    policy: FailurePolicy,
}

impl<L: SessionLauncher> RestartOrchestrator<L> {
    /// Orchestrator over `launcher` applying `policy` to unexpected exits.
    #[must_use]
    pub fn new(launcher: L, policy: FailurePolicy) -> Self {
        Self { launcher, policy }
    }

    /// Start the first session, then react to inputs until `cancel` fires or
    /// a stop fails.
    ///
    /// Watch errors are logged and never end the loop. A start aborted by
    /// `cancel` counts as a clean shutdown.
    ///
    /// # Errors
    ///
    /// - Any error from the first start.
    /// - Any stop error.
    /// - Under [`FailurePolicy::Exit`]: a failed restart, or
    ///   `AppError::UnexpectedExit` for an exit other than `NormalExit(0)`.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<ChangeEvent>,
        mut watch_errors: mpsc::Receiver<AppError>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut generation: u64 = 1;
        let first = match self.launcher.launch(cancel.clone()).await {
            Ok(session) => session,
            Err(err) if cancel.is_cancelled() => {
                info!(%err, "cancelled while starting the first session");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let mut current = Some(first);
        info!(generation, "session started");

        let mut events_open = true;
        let mut errors_open = true;

        loop {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Shutdown,
                outcome = next_exit(&mut current) => Step::Exited(outcome),
                event = events.recv(), if events_open => {
                    event.map_or(Step::EventsClosed, Step::Changed)
                }
                err = watch_errors.recv(), if errors_open => {
                    err.map_or(Step::ErrorsClosed, Step::WatchError)
                }
            };

            match step {
                Step::Shutdown => {
                    info!(generation, "cancellation received, stopping current session");
                    if let Some(session) = current.take() {
                        stop_session(session, generation).await?;
                    }
                    return Ok(());
                }
                Step::Exited(outcome) => {
                    warn!(generation, %outcome, "main command exited without a stop request");
                    if let Some(session) = current.take() {
                        stop_session(session, generation).await?;
                    }
                    match self.policy {
                        FailurePolicy::Wait => {
                            info!("waiting for the next change before restarting");
                        }
                        FailurePolicy::Exit if outcome.is_success() => return Ok(()),
                        FailurePolicy::Exit => return Err(AppError::UnexpectedExit(outcome)),
                    }
                }
                Step::Changed(event) => {
                    debug!(
                        generation,
                        file = %event.file.display(),
                        changed_at = %event.timestamp.format("%m-%d-%Y %H:%M:%S"),
                        "file changed, restarting"
                    );
                    if let Some(session) = current.take() {
                        stop_session(session, generation).await?;
                    }
                    if cancel.is_cancelled() {
                        info!("cancelled during restart, not starting a new session");
                        return Ok(());
                    }

                    generation += 1;
                    match self.launcher.launch(cancel.clone()).await {
                        Ok(session) => {
                            info!(generation, "session started");
                            current = Some(session);
                        }
                        Err(err) if cancel.is_cancelled() => {
                            info!(generation, %err, "cancelled while restarting");
                            return Ok(());
                        }
                        Err(err) if self.policy == FailurePolicy::Wait => {
                            error!(generation, %err, "restart failed, waiting for the next change");
                        }
                        Err(err) => {
                            error!(generation, %err, "restart failed");
                            return Err(err);
                        }
                    }
                }
                Step::WatchError(err) => {
                    warn!(%err, "file watch error");
                }
                Step::EventsClosed => {
                    warn!("change notifier closed, no further restarts");
                    events_open = false;
                }
                Step::ErrorsClosed => {
                    errors_open = false;
                }
            }
        }
    }
}

async fn next_exit(current: &mut Option<Session>) -> ExitOutcome {
    match current {
        Some(session) => session.exit.recv().await,
        None => std::future::pending().await,
    }
}

async fn stop_session(session: Session, generation: u64) -> Result<()> {
    let stopped = session
        .stopper
        .stop()
        .instrument(info_span!("session", generation))
        .await;
    match stopped {
        Ok(report) => {
            debug!(
                generation,
                outcome = %report.outcome,
                killed = report.killed,
                elapsed = ?report.elapsed,
                "session stopped"
            );
            Ok(())
        }
        Err(err) => {
            error!(generation, %err, "stopping the current session failed");
            Err(err)
        }
    }
}
