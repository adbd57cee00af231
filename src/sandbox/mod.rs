//! Sandbox lifecycle and user interaction

pub mod chooser;
pub mod manager;

pub use chooser::{select_chooser, Chooser, InteractiveChooser, NonInteractiveChooser};
pub use manager::{DestroyOptions, LifecycleState, Provisioned, RunOptions, SandboxManager, StateFilter};
