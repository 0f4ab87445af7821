//! OS process control.
//!
//! [`handle::ProcessHandle`] owns one spawned process and signals its whole
//! process group. [`factory::RunnableFactory`] builds handles from a
//! [`CommandSpec`](crate::models::command::CommandSpec) without applying any
//! policy.

pub mod factory;
pub mod handle;

pub use factory::{OsRunnableFactory, RunnableFactory};
pub use handle::{ProcessHandle, Runnable};
