#![forbid(unsafe_code)]

//! Watch files and gracefully restart a long-running command on change.
//!
//! The core is the [`process`] layer (process-group control) and the
//! [`orchestrator`] (per-session execution controller plus the restart
//! loop). [`config`] and [`notifier`] feed it validated settings and file
//! change events.

pub mod config;
pub mod errors;
pub mod models;
pub mod notifier;
pub mod orchestrator;
pub mod process;

pub use config::{ReloaderConfig, Settings};
pub use errors::{AppError, Result};
