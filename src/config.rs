//! Configuration parsing, CLI overrides and validation.
//!
//! A [`ReloaderConfig`] is read from an optional TOML file, patched with
//! command-line overrides and then [`resolve`](ReloaderConfig::resolve)d into
//! the validated [`Settings`] the supervisor runs with.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::command::{CommandSpec, SessionConfig};
use crate::models::event::WatchPattern;
use crate::models::outcome::SignalKind;
use crate::orchestrator::controller::ControllerOptions;
use crate::orchestrator::restart::FailurePolicy;
use crate::{AppError, Result};

/// Log levels accepted by `log_level` / `--log-level`.
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn default_patterns() -> Vec<String> {
    vec!["*".into()]
}

fn default_log_level() -> String {
    "info".into()
}

fn default_grace_period_seconds() -> u64 {
    10
}

fn default_hook_timeout_seconds() -> u64 {
    30
}

fn default_stop_signal() -> SignalKind {
    SignalKind::Interrupt
}

/// Configuration as written in `reloader.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ReloaderConfig {
    /// File patterns to watch, e.g. `src/*.rs`.
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
    /// One of [`LOG_LEVELS`].
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seconds between the stop signal and the kill.
    #[serde(default = "default_grace_period_seconds")]
    pub grace_period_seconds: u64,
    /// Seconds a single hook may run.
    #[serde(default = "default_hook_timeout_seconds")]
    pub hook_timeout_seconds: u64,
    /// Reaction to an unexpected exit or failed restart.
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Signal used to request a graceful stop.
    #[serde(default = "default_stop_signal")]
    pub stop_signal: SignalKind,
    /// The supervised command.
    #[serde(default)]
    pub command: Option<CommandSpec>,
    /// Commands run before each start.
    #[serde(default)]
    pub before: Vec<CommandSpec>,
    /// Commands run after each stop.
    #[serde(default)]
    pub after: Vec<CommandSpec>,
    /// Directory relative paths resolve against; the config file's directory.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl Default for ReloaderConfig {
    fn default() -> Self {
        Self {
            patterns: default_patterns(),
            log_level: default_log_level(),
            grace_period_seconds: default_grace_period_seconds(),
            hook_timeout_seconds: default_hook_timeout_seconds(),
            on_failure: FailurePolicy::default(),
            stop_signal: default_stop_signal(),
            command: None,
            before: Vec::new(),
            after: Vec::new(),
            base_dir: None,
        }
    }
}

/// Values given on the command line; `Some`/non-empty entries win over the
/// file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    /// Main command line, split on whitespace.
    pub command: Option<String>,
    /// Before-hook command lines.
    pub before: Vec<String>,
    /// After-hook command lines.
    pub after: Vec<String>,
    /// Space separated watch patterns.
    pub patterns: Option<String>,
    /// Log level.
    pub log_level: Option<String>,
    /// Grace period in seconds.
    pub grace_period_seconds: Option<u64>,
    /// Hook timeout in seconds.
    pub hook_timeout_seconds: Option<u64>,
    /// Failure policy.
    pub on_failure: Option<FailurePolicy>,
    /// Stop signal.
    pub stop_signal: Option<SignalKind>,
}

/// Validated runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Hooks and main command.
    pub session: SessionConfig,
    /// Watched directories and globs.
    pub patterns: Vec<WatchPattern>,
    /// Validated log level.
    pub log_level: String,
    /// Grace period, hook timeout and stop signal.
    pub options: ControllerOptions,
    /// Reaction to unexpected exits.
    pub on_failure: FailurePolicy,
}

impl ReloaderConfig {
    /// Read configuration from a TOML file. Relative paths inside it resolve
    /// against the file's directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be read, or
    /// `AppError::Config` if it cannot be parsed.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            AppError::Io(format!("failed to read config '{}': {err}", path.display()))
        })?;
        let mut config = Self::from_toml_str(&raw)?;
        let canonical = path
            .canonicalize()
            .map_err(|err| AppError::Config(format!("config path invalid: {err}")))?;
        config.base_dir = canonical.parent().map(Path::to_path_buf);
        Ok(config)
    }

    /// Parse configuration from a TOML string. No validation happens until
    /// [`resolve`](Self::resolve).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for invalid TOML or unknown keys.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Apply command-line overrides. Flag commands run in the current
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for a blank command line or if the current
    /// directory cannot be read.
    pub fn apply_overrides(&mut self, overrides: ConfigOverrides) -> Result<()> {
        let has_commands = overrides.command.is_some()
            || !overrides.before.is_empty()
            || !overrides.after.is_empty();
        let cwd = if has_commands {
            current_dir()?
        } else {
            PathBuf::new()
        };

        if let Some(line) = overrides.command {
            self.command = Some(parse_command_line(&line, &cwd)?);
        }
        if !overrides.before.is_empty() {
            self.before = parse_command_lines(&overrides.before, &cwd)?;
        }
        if !overrides.after.is_empty() {
            self.after = parse_command_lines(&overrides.after, &cwd)?;
        }
        if let Some(patterns) = overrides.patterns {
            self.patterns = patterns.split_whitespace().map(str::to_owned).collect();
        }
        if let Some(level) = overrides.log_level {
            self.log_level = level;
        }
        if let Some(seconds) = overrides.grace_period_seconds {
            self.grace_period_seconds = seconds;
        }
        if let Some(seconds) = overrides.hook_timeout_seconds {
            self.hook_timeout_seconds = seconds;
        }
        if let Some(policy) = overrides.on_failure {
            self.on_failure = policy;
        }
        if let Some(signal) = overrides.stop_signal {
            self.stop_signal = signal;
        }
        Ok(())
    }

    /// Validate and produce runtime settings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the main command is missing, a program
    /// is blank, a working or watched directory does not exist, the log
    /// level is unknown, no pattern is given, a duration is zero, or the
    /// stop signal is `kill`.
    pub fn resolve(self) -> Result<Settings> {
        let base = match self.base_dir {
            Some(dir) => dir,
            None => current_dir()?,
        };

        let level = self.log_level.trim().to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(AppError::Config(format!(
                "log_level '{}' must be one of {LOG_LEVELS:?}",
                self.log_level
            )));
        }

        if self.grace_period_seconds == 0 {
            return Err(AppError::Config(
                "grace_period_seconds must be greater than zero".into(),
            ));
        }
        if self.hook_timeout_seconds == 0 {
            return Err(AppError::Config(
                "hook_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.stop_signal == SignalKind::Kill {
            return Err(AppError::Config(
                "stop_signal must be interrupt or terminate".into(),
            ));
        }

        let mut main_command = self
            .command
            .ok_or_else(|| AppError::Config("a main command is required".into()))?;
        main_command.validate(&base)?;

        let mut before_hooks = self.before;
        for hook in &mut before_hooks {
            hook.validate(&base)?;
        }
        let mut after_hooks = self.after;
        for hook in &mut after_hooks {
            hook.validate(&base)?;
        }

        let patterns = resolve_patterns(&self.patterns, &base)?;

        Ok(Settings {
            session: SessionConfig {
                before_hooks,
                main_command,
                after_hooks,
            },
            patterns,
            log_level: level,
            options: ControllerOptions {
                grace_period: Duration::from_secs(self.grace_period_seconds),
                hook_timeout: Duration::from_secs(self.hook_timeout_seconds),
                stop_signal: self.stop_signal,
            },
            on_failure: self.on_failure,
        })
    }
}

fn current_dir() -> Result<PathBuf> {
    env::current_dir()
        .map_err(|err| AppError::Config(format!("cannot read current directory: {err}")))
}

fn parse_command_line(line: &str, dir: &Path) -> Result<CommandSpec> {
    CommandSpec::from_command_line(line, dir)
        .ok_or_else(|| AppError::Config(format!("command '{line}' is empty")))
}

fn parse_command_lines(lines: &[String], dir: &Path) -> Result<Vec<CommandSpec>> {
    lines
        .iter()
        .map(|line| parse_command_line(line, dir))
        .collect()
}

/// Split patterns and canonicalize their directories.
fn resolve_patterns(raw: &[String], base: &Path) -> Result<Vec<WatchPattern>> {
    let mut patterns = Vec::new();
    for entry in raw.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        let mut pattern = WatchPattern::parse(entry, base)?;
        pattern.directory = pattern.directory.canonicalize().map_err(|err| {
            AppError::Config(format!(
                "watch directory '{}' invalid: {err}",
                pattern.directory.display()
            ))
        })?;
        patterns.push(pattern);
    }

    if patterns.is_empty() {
        return Err(AppError::Config("at least one watch pattern is required".into()));
    }
    Ok(patterns)
}
