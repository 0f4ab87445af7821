//! Domain model module declarations.

pub mod command;
pub mod event;
pub mod outcome;
