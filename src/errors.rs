//! Error types shared across the supervisor.

use std::fmt::{Display, Formatter};

use crate::models::outcome::ExitOutcome;

/// Shared result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every failure mode of a reload cycle.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Executable could not be launched (missing or not permitted).
    Spawn(String),
    /// A before/after hook failed, timed out, or was cancelled.
    Hook(String),
    /// The main command did not stop cleanly.
    Stop(String),
    /// File watch layer failure.
    Watch(String),
    /// The main command exited without a requested stop.
    UnexpectedExit(ExitOutcome),
    /// A session was started while a previous one was still live.
    SessionActive,
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Hook(msg) => write!(f, "hook: {msg}"),
            Self::Stop(msg) => write!(f, "stop: {msg}"),
            Self::Watch(msg) => write!(f, "watch: {msg}"),
            Self::UnexpectedExit(outcome) => write!(f, "unexpected exit: {outcome}"),
            Self::SessionActive => write!(f, "session active: previous session not stopped"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<notify::Error> for AppError {
    fn from(err: notify::Error) -> Self {
        Self::Watch(err.to_string())
    }
}
