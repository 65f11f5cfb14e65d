//! Template rendering for worker command arguments.

mod command;

pub use command::{CommandContext, CommandRenderer};
