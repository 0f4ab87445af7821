//! Command and session descriptions consumed by the execution controller.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{AppError, Result};

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

/// One OS command invocation.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CommandSpec {
    /// Executable name or path.
    pub program: String,
    /// Ordered arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; absolute after [`CommandSpec::validate`].
    #[serde(default = "default_dir")]
    pub dir: PathBuf,
    /// Overrides merged onto the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    /// Build a spec for `program` running in `dir` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: dir.into(),
            env: HashMap::new(),
        }
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add one environment override.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Split a whitespace-separated command line into program and arguments.
    ///
    /// Returns `None` when the line holds no program.
    #[must_use]
    pub fn from_command_line(line: &str, dir: impl Into<PathBuf>) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, dir).args(parts))
    }

    /// Trim the program, resolve `dir` against `base` and require it to be an
    /// existing directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an empty program or an invalid
    /// working directory.
    pub fn validate(&mut self, base: &Path) -> Result<()> {
        let program = self.program.trim();
        if program.is_empty() {
            return Err(AppError::Config("command program must not be empty".into()));
        }
        self.program = program.to_owned();

        let joined = if self.dir.is_absolute() {
            self.dir.clone()
        } else {
            base.join(&self.dir)
        };
        let canonical = joined.canonicalize().map_err(|err| {
            AppError::Config(format!(
                "working directory '{}' invalid: {err}",
                joined.display()
            ))
        })?;
        if !canonical.is_dir() {
            return Err(AppError::Config(format!(
                "working directory '{}' is not a directory",
                canonical.display()
            )));
        }
        self.dir = canonical;
        Ok(())
    }
}

impl Display for CommandSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Everything one session runs: hooks around a single main command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Commands run to completion, in order, before the main command starts.
    pub before_hooks: Vec<CommandSpec>,
    /// The long-running supervised command.
    pub main_command: CommandSpec,
    /// Commands run to completion, in order, after the main command stopped.
    pub after_hooks: Vec<CommandSpec>,
}

impl SessionConfig {
    /// Session with no hooks.
    #[must_use]
    pub fn new(main_command: CommandSpec) -> Self {
        Self {
            before_hooks: Vec::new(),
            main_command,
            after_hooks: Vec::new(),
        }
    }
}
