use clap::Parser;
use std::path::PathBuf;

use crate::config::daemon::{DEFAULT_STATE_DIR, DEFAULT_SYSFS_ROOT};

#[derive(Parser)]
pub struct ShowStateArgs {
    #[arg(
        long,
        help = "Directory holding the CPU manager checkpoint",
        env = "CPU_MANAGER_STATE_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_STATE_DIR
    )]
    pub state_dir: PathBuf,
}

#[derive(Parser)]
pub struct ShowTopologyArgs {
    #[arg(
        long,
        help = "Root of the sysfs tree to read the CPU topology from",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_SYSFS_ROOT
    )]
    pub sysfs_root: PathBuf,
}
