//! Utility modules

pub mod debug;
pub mod exec;

pub use debug::DebugLogger;
pub use exec::{command_exists, execute_command, CommandOutput};
