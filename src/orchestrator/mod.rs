//! Session orchestration.
//!
//! Covers the per-session execution controller (hooks, main command,
//! graceful stop) and the restart loop that serializes stop/start cycles in
//! response to file changes.

pub mod controller;
pub mod restart;
