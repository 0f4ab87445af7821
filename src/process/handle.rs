//! Process handle with process-group signalling.
//!
//! Every spawned command becomes the leader of a fresh process group, so a
//! signal reaches the command and anything it launched (a shell script and
//! its children, `cargo run` and the built binary, ...). Standard output and
//! error are inherited from the supervisor; stdin is closed.
//!
//! Cancelling the handle's scope delivers an interrupt to the group, which
//! makes a handle behave like a context-bound command.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::command::CommandSpec;
use crate::models::outcome::{ExitOutcome, SignalKind};
use crate::{AppError, Result};

/// One OS process invocation with group-level control.
pub trait Runnable: Send + Sync {
    /// Spawn the process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Spawn` if the executable cannot be launched or the
    /// handle was already started.
    fn start(&mut self) -> Result<()>;

    /// Wait for the process to exit.
    ///
    /// Intended for a single waiter; concurrent callers are serialized.
    fn wait(&self) -> Pin<Box<dyn Future<Output = ExitOutcome> + Send + '_>>;

    /// Deliver `kind` to the process group. A no-op before start or after exit.
    fn signal(&self, kind: SignalKind);

    /// Unconditionally terminate the process group.
    fn kill(&self) {
        self.signal(SignalKind::Kill);
    }

    /// Process group id, once started.
    fn pgid(&self) -> Option<u32>;

    /// Signals actually delivered to the group, in order.
    fn delivered_signals(&self) -> Vec<SignalKind>;

    /// Command this handle runs.
    fn spec(&self) -> &CommandSpec;
}

/// Signal target shared between the handle and its cancellation watcher.
#[derive(Debug, Clone)]
struct ProcessGroup {
    pgid: u32,
    exited: CancellationToken,
    delivered: Arc<StdMutex<Vec<SignalKind>>>,
}

impl ProcessGroup {
    fn signal(&self, kind: SignalKind) {
        if self.exited.is_cancelled() {
            debug!(pgid = self.pgid, %kind, "process already exited, signal skipped");
            return;
        }

        match deliver(self.pgid, kind) {
            Ok(()) => {
                debug!(pgid = self.pgid, %kind, "signal delivered to process group");
                self.delivered
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(kind);
            }
            Err(err) => {
                warn!(pgid = self.pgid, %kind, %err, "failed to signal process group");
            }
        }
    }
}

#[cfg(unix)]
fn deliver(pgid: u32, kind: SignalKind) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let raw = i32::try_from(pgid).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "pgid out of range")
    })?;

    match killpg(Pid::from_raw(raw), kind.to_nix()) {
        // The group vanished between exit and reap; nothing left to signal.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

#[cfg(not(unix))]
fn deliver(pid: u32, kind: SignalKind) -> std::io::Result<()> {
    // No process groups here: tear down the tree rooted at the process.
    let mut killer = std::process::Command::new("taskkill");
    killer.args(["/pid", &pid.to_string(), "/t"]);
    if kind == SignalKind::Kill {
        killer.arg("/f");
    }
    let status = killer
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else {
        Err(std::io::Error::other(format!("taskkill exited with {status}")))
    }
}

/// [`Runnable`] backed by a `tokio::process::Child`.
#[derive(Debug)]
pub struct ProcessHandle {
    spec: CommandSpec,
    cancel: CancellationToken,
    child: Mutex<Option<Child>>,
    group: Option<ProcessGroup>,
    exited: CancellationToken,
    delivered: Arc<StdMutex<Vec<SignalKind>>>,
}

impl ProcessHandle {
    /// Unstarted handle for `spec` bound to the `cancel` scope.
    #[must_use]
    pub fn new(spec: CommandSpec, cancel: CancellationToken) -> Self {
        Self {
            spec,
            cancel,
            child: Mutex::new(None),
            group: None,
            exited: CancellationToken::new(),
            delivered: Arc::default(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.spec.program);
        cmd.args(&self.spec.args)
            .envs(&self.spec.env)
            .current_dir(&self.spec.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

impl Runnable for ProcessHandle {
    fn start(&mut self) -> Result<()> {
        if self.group.is_some() {
            return Err(AppError::Spawn(format!("'{}' already started", self.spec)));
        }

        let child = self
            .command()
            .spawn()
            .map_err(|err| AppError::Spawn(format!("failed to spawn '{}': {err}", self.spec)))?;
        let pgid = child.id().ok_or_else(|| {
            AppError::Spawn(format!("'{}' exited before its pid was read", self.spec))
        })?;

        let group = ProcessGroup {
            pgid,
            exited: self.exited.clone(),
            delivered: Arc::clone(&self.delivered),
        };

        let watcher = group.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(pgid = watcher.pgid, "scope cancelled, interrupting process group");
                    watcher.signal(SignalKind::Interrupt);
                }
                () = watcher.exited.cancelled() => {}
            }
        });

        *self.child.get_mut() = Some(child);
        self.group = Some(group);
        Ok(())
    }

    fn wait(&self) -> Pin<Box<dyn Future<Output = ExitOutcome> + Send + '_>> {
        Box::pin(async move {
            let mut guard = self.child.lock().await;
            let Some(child) = guard.as_mut() else {
                return ExitOutcome::Error(format!("'{}' was never started", self.spec));
            };

            let outcome = match child.wait().await {
                Ok(status) => ExitOutcome::from_status(status),
                Err(err) => ExitOutcome::Error(err.to_string()),
            };
            self.exited.cancel();
            outcome
        })
    }

    fn signal(&self, kind: SignalKind) {
        match &self.group {
            Some(group) => group.signal(kind),
            None => debug!(command = %self.spec, %kind, "process not started, signal skipped"),
        }
    }

    fn pgid(&self) -> Option<u32> {
        self.group.as_ref().map(|group| group.pgid)
    }

    fn delivered_signals(&self) -> Vec<SignalKind> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn spec(&self) -> &CommandSpec {
        &self.spec
    }
}
