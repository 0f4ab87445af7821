//! File change notifier.
//!
//! [`FileNotifier`] uses the `notify` crate to watch the directory of every
//! [`WatchPattern`] (non-recursively). Create and content-modify events for
//! paths matching one of the globs are forwarded as [`ChangeEvent`]s; watch
//! failures are forwarded as `AppError::Watch`. Both channels are inputs to
//! the restart loop only.
//!
//! The `notify` callback runs on the watcher's own thread, so events are
//! handed over with `blocking_send`.

use std::collections::BTreeSet;
use std::path::Path;

use glob::{MatchOptions, Pattern};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::models::event::{ChangeEvent, WatchPattern};
use crate::{AppError, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compile `directory/pattern` globs, escaping the directory part.
///
/// # Errors
///
/// Returns `AppError::Config` for a non UTF-8 directory or invalid glob.
pub fn compile_patterns(patterns: &[WatchPattern]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|watch| {
            let dir = watch.directory.to_str().ok_or_else(|| {
                AppError::Config(format!(
                    "watch directory '{}' is not valid UTF-8",
                    watch.directory.display()
                ))
            })?;
            let dir = dir.trim_end_matches(std::path::MAIN_SEPARATOR);
            let full = format!(
                "{}{}{}",
                Pattern::escape(dir),
                std::path::MAIN_SEPARATOR,
                watch.pattern
            );
            Pattern::new(&full).map_err(|err| {
                AppError::Config(format!("invalid watch pattern '{}': {err}", watch.pattern))
            })
        })
        .collect()
}

/// Whether `path` matches any of the compiled globs.
#[must_use]
pub fn is_match(matchers: &[Pattern], path: &Path) -> bool {
    matchers
        .iter()
        .any(|pattern| pattern.matches_path_with(path, MATCH_OPTIONS))
}

/// Content-level changes only; metadata and access events are ignored.
fn is_change(event: &Event) -> bool {
    match &event.kind {
        EventKind::Create(_) => true,
        EventKind::Modify(kind) => !matches!(kind, ModifyKind::Metadata(_)),
        _ => false,
    }
}

/// Keeps a `notify` watcher alive; dropping it stops watching.
pub struct FileNotifier {
    _watcher: RecommendedWatcher,
    patterns: Vec<WatchPattern>,
}

impl FileNotifier {
    /// Start watching the directories of `patterns`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for an invalid pattern, or
    /// `AppError::Watch` if the watcher cannot be created or a directory
    /// cannot be watched.
    pub fn start(
        patterns: Vec<WatchPattern>,
        events: mpsc::Sender<ChangeEvent>,
        errors: mpsc::Sender<AppError>,
    ) -> Result<Self> {
        let matchers = compile_patterns(&patterns)?;

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) if is_change(&event) => {
                    for path in event.paths.iter().filter(|path| is_match(&matchers, path)) {
                        if events.blocking_send(ChangeEvent::now(path.clone())).is_err() {
                            debug!("change receiver dropped, event discarded");
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if errors.blocking_send(AppError::from(err)).is_err() {
                        debug!("watch error receiver dropped");
                    }
                }
            },
        )
        .map_err(|err| AppError::Watch(format!("failed to create file watcher: {err}")))?;

        let directories: BTreeSet<&Path> = patterns
            .iter()
            .map(|watch| watch.directory.as_path())
            .collect();
        for dir in directories {
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(|err| {
                    AppError::Watch(format!("failed to watch '{}': {err}", dir.display()))
                })?;
            debug!(dir = %dir.display(), "watching directory");
        }

        for watch in &patterns {
            info!(path = %watch.full_pattern().display(), "will watch");
        }

        Ok(Self {
            _watcher: watcher,
            patterns,
        })
    }

    /// Patterns being watched.
    #[must_use]
    pub fn patterns(&self) -> &[WatchPattern] {
        &self.patterns
    }
}
