//! Execution controller: one session of before-hooks, main command, stop,
//! after-hooks.
//!
//! [`ExecutionController::start`] runs the before-hooks, spawns the main
//! command and hands back a [`Session`]. The session's [`Stopper`] drives the
//! graceful-stop protocol (stop signal, grace period, kill) followed by the
//! after-hooks; its [`ExitNotice`] fires only if the main command ends
//! without a requested stop.
//!
//! A single background waiter owns the `wait()` on the main process. It
//! publishes the outcome into a write-once cell and then routes it to the
//! unexpected-exit notice only if it wins the race against a stop request
//! on a shared atomic routing flag.

use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::models::command::{CommandSpec, SessionConfig};
use crate::models::outcome::{ExitOutcome, SignalKind};
use crate::process::{Runnable, RunnableFactory};
use crate::{AppError, Result};

/// Default time a stopping process gets before it is killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Default bound on a single hook run.
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Timing and signal settings for sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerOptions {
    /// Time between the stop signal and the kill.
    pub grace_period: Duration,
    /// Per-hook timeout.
    pub hook_timeout: Duration,
    /// Signal that starts a graceful stop.
    pub stop_signal: SignalKind,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            stop_signal: SignalKind::Interrupt,
        }
    }
}

/// Lifecycle position of the controller's current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session has been started.
    Idle,
    /// Before-hooks are running.
    BeforeHooksRunning,
    /// The main command is being spawned.
    MainStarting,
    /// The main command is running.
    MainRunning,
    /// A stop was requested and the main command has not exited yet.
    Stopping,
    /// After-hooks are running.
    AfterHooksRunning,
    /// The session ended cleanly.
    Stopped,
    /// Start or stop failed.
    Failed,
}

/// Result of a successful stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// How the main command ended.
    pub outcome: ExitOutcome,
    /// Whether the grace period elapsed and the group was killed.
    pub killed: bool,
    /// Time from the stop request until the main command exited.
    pub elapsed: Duration,
}

/// The stop operation of one session. Consumed by [`Stopper::stop`], so it
/// runs at most once.
pub struct Stopper(Box<dyn FnOnce() -> BoxFuture<'static, Result<StopReport>> + Send>);

impl Stopper {
    /// Wrap a stop routine.
    #[must_use]
    pub fn new<F, Fut>(stop: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<StopReport>> + Send + 'static,
    {
        Self(Box::new(move || stop().boxed()))
    }

    /// Stop the session and run its after-hooks.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Stop` if, after the stop request, the main command
    /// ended in a way the stop did not cause, or `AppError::Hook` if an
    /// after-hook failed. A session whose main command had already exited on
    /// its own only runs its after-hooks; its outcome is in the report.
    pub async fn stop(self) -> Result<StopReport> {
        (self.0)().await
    }
}

impl Debug for Stopper {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Stopper(..)")
    }
}

/// Notification that the main command ended without a requested stop.
#[derive(Debug)]
pub struct ExitNotice {
    rx: Option<oneshot::Receiver<ExitOutcome>>,
}

impl ExitNotice {
    /// Resolve with the outcome of an unexpected exit.
    ///
    /// Stays pending forever once delivered, or when the session was stopped
    /// on request. Cancel safe.
    pub async fn recv(&mut self) -> ExitOutcome {
        if let Some(rx) = self.rx.as_mut() {
            let received = rx.await;
            self.rx = None;
            if let Ok(outcome) = received {
                return outcome;
            }
        }
        std::future::pending().await
    }
}

impl From<oneshot::Receiver<ExitOutcome>> for ExitNotice {
    fn from(rx: oneshot::Receiver<ExitOutcome>) -> Self {
        Self { rx: Some(rx) }
    }
}

/// A started session.
#[derive(Debug)]
pub struct Session {
    /// Stops the session.
    pub stopper: Stopper,
    /// Fires if the main command ends on its own.
    pub exit: ExitNotice,
    /// Process group of the main command.
    pub pgid: Option<u32>,
}

const RUNNING: u8 = 0;
const STOP_REQUESTED: u8 = 1;
const EXITED: u8 = 2;

/// Decides, exactly once, whether an exit belongs to a stop or is unexpected.
#[derive(Debug, Default)]
struct ExitRouting(AtomicU8);

impl ExitRouting {
    /// Claim the exit for the stop sequence. `false` if the process already
    /// exited on its own.
    fn request_stop(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, STOP_REQUESTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Claim the exit for the unexpected-exit notice. `false` if a stop was
    /// requested first.
    fn claim_exit(&self) -> bool {
        self.0
            .compare_exchange(RUNNING, EXITED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Clears the controller's live-session flag when dropped.
#[derive(Debug)]
struct LiveGuard(Arc<AtomicBool>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Everything the controller holds for the one live session.
struct RunHandle {
    handle: Arc<dyn Runnable>,
    outcome: watch::Receiver<Option<ExitOutcome>>,
    routing: Arc<ExitRouting>,
    killed: bool,
    _scope: DropGuard,
    _live: LiveGuard,
}

impl RunHandle {
    fn has_exited(&self) -> bool {
        self.outcome.borrow().is_some()
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if !self.has_exited() {
            warn!(
                pgid = self.handle.pgid(),
                "session released without a stop, killing process group"
            );
            self.handle.kill();
        }
    }
}

/// Runs sessions for one [`SessionConfig`], never more than one at a time.
pub struct ExecutionController {
    config: Arc<SessionConfig>,
    factory: Arc<dyn RunnableFactory>,
    options: ControllerOptions,
    live: Arc<AtomicBool>,
    state: Arc<watch::Sender<SessionState>>,
}

impl ExecutionController {
    /// Controller for `config` spawning processes through `factory`.
    #[must_use]
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn RunnableFactory>,
        options: ControllerOptions,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            config: Arc::new(config),
            factory,
            options,
            live: Arc::new(AtomicBool::new(false)),
            state: Arc::new(state),
        }
    }

    /// Subscribe to session state transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Run the before-hooks and start the main command.
    ///
    /// The main command runs under a child of `scope`; cancelling `scope`
    /// interrupts it and aborts any before-hook still running.
    ///
    /// # Errors
    ///
    /// - `AppError::SessionActive` if the previous session was not stopped.
    /// - `AppError::Hook` if a before-hook failed; no main process is spawned.
    /// - `AppError::Spawn` if the main command cannot be launched.
    pub async fn start(&self, scope: &CancellationToken) -> Result<Session> {
        if self
            .live
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::SessionActive);
        }
        let live = LiveGuard(Arc::clone(&self.live));

        self.state.send_replace(SessionState::BeforeHooksRunning);
        if let Err(err) = run_hooks(
            "before",
            &self.config.before_hooks,
            self.factory.as_ref(),
            &self.options,
            scope,
        )
        .await
        {
            self.state.send_replace(SessionState::Failed);
            return Err(err);
        }

        self.state.send_replace(SessionState::MainStarting);
        let session_scope = scope.child_token();
        let mut handle = self
            .factory
            .create(&self.config.main_command, session_scope.clone());
        if let Err(err) = handle.start() {
            error!(command = %self.config.main_command, %err, "main command failed to start");
            self.state.send_replace(SessionState::Failed);
            return Err(err);
        }
        let handle: Arc<dyn Runnable> = Arc::from(handle);
        let pgid = handle.pgid();
        info!(command = %self.config.main_command, pgid, "main command started");
        self.state.send_replace(SessionState::MainRunning);

        let routing = Arc::new(ExitRouting::default());
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let (exit_tx, exit_rx) = oneshot::channel();

        let waiter = Arc::clone(&handle);
        let waiter_routing = Arc::clone(&routing);
        tokio::spawn(
            async move {
                let outcome = waiter.wait().await;
                debug!(%outcome, "main command exited");
                outcome_tx.send_replace(Some(outcome.clone()));
                if waiter_routing.claim_exit() && exit_tx.send(outcome).is_err() {
                    debug!("unexpected-exit receiver already dropped");
                }
            }
            .instrument(info_span!("main_waiter", pgid)),
        );

        let sequence = StopSequence {
            run: RunHandle {
                handle,
                outcome: outcome_rx,
                routing,
                killed: false,
                _scope: session_scope.drop_guard(),
                _live: live,
            },
            config: Arc::clone(&self.config),
            factory: Arc::clone(&self.factory),
            options: self.options,
            state: Arc::clone(&self.state),
            shutdown: scope.clone(),
        };

        Ok(Session {
            stopper: Stopper::new(move || sequence.run()),
            exit: ExitNotice::from(exit_rx),
            pgid,
        })
    }
}

/// Owned state of one pending stop.
struct StopSequence {
    run: RunHandle,
    config: Arc<SessionConfig>,
    factory: Arc<dyn RunnableFactory>,
    options: ControllerOptions,
    state: Arc<watch::Sender<SessionState>>,
    shutdown: CancellationToken,
}

/// Scope for after-hooks. Teardown started during shutdown runs to completion
/// (bounded by the hook timeout); a shutdown arriving while teardown runs is
/// forwarded so a blocked hook is interrupted.
fn teardown_scope(shutdown: &CancellationToken) -> CancellationToken {
    let scope = CancellationToken::new();
    if shutdown.is_cancelled() {
        return scope;
    }
    let shutdown = shutdown.clone();
    let forward = scope.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = shutdown.cancelled() => forward.cancel(),
            () = forward.cancelled() => {}
        }
    });
    scope
}

impl StopSequence {
    async fn run(mut self) -> Result<StopReport> {
        let pgid = self.run.handle.pgid();
        let span = info_span!("stop", pgid);
        async move {
            let requested_at = Instant::now();
            self.state.send_replace(SessionState::Stopping);

            let stop_requested = self.run.routing.request_stop();
            if stop_requested {
                let signal = self.options.stop_signal;
                if !self.run.handle.delivered_signals().contains(&signal) {
                    debug!(%signal, "requesting graceful stop");
                    self.run.handle.signal(signal);
                }
            } else {
                debug!("main command already exited, no signal needed");
            }

            let mut outcome_rx = self.run.outcome.clone();
            let outcome =
                match tokio::time::timeout(self.options.grace_period, next_outcome(&mut outcome_rx))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_elapsed) => {
                        warn!(
                            grace = ?self.options.grace_period,
                            "main command still running after grace period, killing process group"
                        );
                        self.run.handle.kill();
                        self.run.killed = true;
                        next_outcome(&mut outcome_rx).await
                    }
                };
            let elapsed = requested_at.elapsed();

            let delivered = self.run.handle.delivered_signals();
            // An exit already routed to the unexpected-exit notice belongs to the
            // caller's failure policy, not to this stop.
            let stopped = if !stop_requested {
                info!(%outcome, "main command had already exited, releasing session");
                Ok(())
            } else if outcome.is_requested_stop(&delivered) {
                info!(%outcome, killed = self.run.killed, ?elapsed, "main command stopped");
                Ok(())
            } else {
                error!(%outcome, ?delivered, "main command did not stop cleanly");
                Err(AppError::Stop(format!("main command {outcome}")))
            };

            self.state.send_replace(SessionState::AfterHooksRunning);
            let teardown = teardown_scope(&self.shutdown);
            let hooks = run_hooks(
                "after",
                &self.config.after_hooks,
                self.factory.as_ref(),
                &self.options,
                &teardown,
            )
            .await;
            teardown.cancel();

            let report = StopReport {
                outcome,
                killed: self.run.killed,
                elapsed,
            };
            drop(self.run);

            let result = match (stopped, hooks) {
                (Err(err), hooks) => {
                    if let Err(hook_err) = hooks {
                        warn!(%hook_err, "after-hook also failed");
                    }
                    Err(err)
                }
                (Ok(()), Err(err)) => Err(err),
                (Ok(()), Ok(())) => Ok(report),
            };

            self.state.send_replace(if result.is_ok() {
                SessionState::Stopped
            } else {
                SessionState::Failed
            });
            result
        }
        .instrument(span)
        .await
    }
}

async fn next_outcome(rx: &mut watch::Receiver<Option<ExitOutcome>>) -> ExitOutcome {
    match rx.wait_for(Option::is_some).await {
        Ok(value) => value
            .clone()
            .unwrap_or_else(|| ExitOutcome::Error("exit outcome missing".into())),
        Err(_) => ExitOutcome::Error("exit waiter dropped before reporting".into()),
    }
}

enum HookEnd {
    Exited(ExitOutcome),
    TimedOut,
    Cancelled,
}

async fn run_hooks(
    stage: &'static str,
    hooks: &[CommandSpec],
    factory: &dyn RunnableFactory,
    options: &ControllerOptions,
    scope: &CancellationToken,
) -> Result<()> {
    for hook in hooks {
        run_hook(stage, hook, factory, options, scope)
            .instrument(info_span!("hook", stage, command = %hook))
            .await?;
    }
    Ok(())
}

/// Run one hook to completion under a fresh child scope that is released on
/// every return path.
async fn run_hook(
    stage: &'static str,
    spec: &CommandSpec,
    factory: &dyn RunnableFactory,
    options: &ControllerOptions,
    scope: &CancellationToken,
) -> Result<()> {
    let hook_scope = scope.child_token();
    let _release = hook_scope.clone().drop_guard();

    let mut handle = factory.create(spec, hook_scope.clone());
    handle
        .start()
        .map_err(|err| AppError::Hook(format!("{stage} hook '{spec}' failed to start: {err}")))?;
    info!("running hook");

    let end = tokio::select! {
        outcome = handle.wait() => HookEnd::Exited(outcome),
        () = tokio::time::sleep(options.hook_timeout) => HookEnd::TimedOut,
        () = hook_scope.cancelled() => HookEnd::Cancelled,
    };

    match end {
        HookEnd::Exited(outcome) if outcome.is_success() => {
            debug!("hook finished");
            Ok(())
        }
        HookEnd::Exited(outcome) => Err(AppError::Hook(format!("{stage} hook '{spec}' {outcome}"))),
        HookEnd::TimedOut => {
            handle.kill();
            let outcome = handle.wait().await;
            warn!(%outcome, timeout = ?options.hook_timeout, "hook timed out");
            Err(AppError::Hook(format!(
                "{stage} hook '{spec}' timed out after {:?}",
                options.hook_timeout
            )))
        }
        HookEnd::Cancelled => {
            // The handle already interrupted its group when the scope fired.
            let outcome = match tokio::time::timeout(options.grace_period, handle.wait()).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => {
                    handle.kill();
                    handle.wait().await
                }
            };
            info!(%outcome, "hook cancelled");
            Err(AppError::Hook(format!("{stage} hook '{spec}' cancelled")))
        }
    }
}
