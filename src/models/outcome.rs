//! Exit status interpretation and the signals the supervisor sends.

use std::fmt::{Display, Formatter};
use std::process::ExitStatus;

use clap::ValueEnum;
use serde::Deserialize;

/// Termination request delivered to a process group.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, ValueEnum, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// `SIGINT`; the default graceful stop request.
    Interrupt,
    /// `SIGTERM`.
    Terminate,
    /// `SIGKILL`; unconditional, used after the grace period.
    Kill,
}

impl SignalKind {
    /// Raw signal number on unix hosts.
    #[cfg(unix)]
    #[must_use]
    pub fn as_raw(self) -> i32 {
        self.to_nix() as i32
    }

    /// Matching `nix` signal.
    #[cfg(unix)]
    #[must_use]
    pub fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            Self::Interrupt => Signal::SIGINT,
            Self::Terminate => Signal::SIGTERM,
            Self::Kill => Signal::SIGKILL,
        }
    }
}

impl Display for SignalKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interrupt => f.write_str("interrupt"),
            Self::Terminate => f.write_str("terminate"),
            Self::Kill => f.write_str("kill"),
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited on its own with a status code.
    NormalExit(i32),
    /// Terminated by the given raw signal number.
    SignaledExit(i32),
    /// Waiting failed or the process never ran.
    Error(String),
}

impl ExitOutcome {
    /// Interpret an OS wait status.
    #[must_use]
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::NormalExit(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::SignaledExit(signal);
            }
        }

        Self::Error(format!("unrecognised exit status: {status}"))
    }

    /// Whether this outcome is the expected result of a stop in which the
    /// supervisor delivered `sent`.
    ///
    /// Any normal exit counts; a signaled exit counts only when the signal is
    /// one the supervisor itself delivered.
    #[must_use]
    pub fn is_requested_stop(&self, sent: &[SignalKind]) -> bool {
        match self {
            Self::NormalExit(_) => true,
            Self::SignaledExit(signal) => sent.iter().any(|kind| matches_raw(*kind, *signal)),
            Self::Error(_) => false,
        }
    }

    /// `true` for `NormalExit(0)`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::NormalExit(0))
    }
}

#[cfg(unix)]
fn matches_raw(kind: SignalKind, raw: i32) -> bool {
    kind.as_raw() == raw
}

#[cfg(not(unix))]
fn matches_raw(_kind: SignalKind, _raw: i32) -> bool {
    false
}

impl Display for ExitOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NormalExit(code) => write!(f, "exited with code {code}"),
            Self::SignaledExit(signal) => write!(f, "terminated by signal {signal}"),
            Self::Error(cause) => write!(f, "wait failed: {cause}"),
        }
    }
}
