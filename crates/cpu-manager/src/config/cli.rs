use clap::{Parser, Subcommand};
use utils::version;

use crate::config::daemon::DaemonArgs;
use crate::config::inspect::{ShowStateArgs, ShowTopologyArgs};

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the CPU manager daemon
    Daemon(Box<DaemonArgs>),
    /// Print the checkpointed CPU allocation state
    #[command(name = "show-state")]
    ShowState(ShowStateArgs),
    /// Print the CPU topology discovered from sysfs
    #[command(name = "show-topology")]
    ShowTopology(ShowTopologyArgs),
}
