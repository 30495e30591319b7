//! Command layer - Entry points for the CPU manager subcommands

pub mod daemon;
pub mod inspect;

pub use daemon::run_daemon;
pub use inspect::{run_show_state, run_show_topology};
