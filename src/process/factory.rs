//! Runnable construction.

use tokio_util::sync::CancellationToken;

use crate::models::command::CommandSpec;
use crate::process::handle::{ProcessHandle, Runnable};

/// Builds an unstarted [`Runnable`] for a command under a cancellation scope.
pub trait RunnableFactory: Send + Sync {
    /// Construct the runnable. Nothing is spawned until
    /// [`Runnable::start`] is called.
    fn create(&self, spec: &CommandSpec, cancel: CancellationToken) -> Box<dyn Runnable>;
}

/// Factory producing real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRunnableFactory;

impl RunnableFactory for OsRunnableFactory {
    fn create(&self, spec: &CommandSpec, cancel: CancellationToken) -> Box<dyn Runnable> {
        Box::new(ProcessHandle::new(spec.clone(), cancel))
    }
}
