//! File change events and the patterns that produce them.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::{AppError, Result};

/// A watched file changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Path of the changed file.
    pub file: PathBuf,
    /// When the change was observed.
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Event for `file` stamped with the current time.
    #[must_use]
    pub fn now(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A directory plus a file-name glob inside it, e.g. `src/server` + `*.rs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchPattern {
    /// Absolute directory watched non-recursively.
    pub directory: PathBuf,
    /// Glob matched against file names in `directory`.
    pub pattern: String,
}

impl WatchPattern {
    /// Split a user pattern such as `server/*.rs`, `*.toml` or
    /// `/abs/dir/*.rs` into directory and file glob. Relative directories
    /// resolve against `base`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the pattern has no file component.
    pub fn parse(raw: &str, base: &Path) -> Result<Self> {
        let raw = raw.trim();
        let path = Path::new(raw);
        let pattern = path
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| AppError::Config(format!("watch pattern '{raw}' has no file part")))?
            .to_owned();

        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let directory = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            base.join(dir)
        };

        Ok(Self { directory, pattern })
    }

    /// Full glob (`directory/pattern`) used for matching event paths.
    #[must_use]
    pub fn full_pattern(&self) -> PathBuf {
        self.directory.join(&self.pattern)
    }
}
