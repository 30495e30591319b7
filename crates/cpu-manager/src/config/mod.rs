pub mod cli;
pub mod daemon;
pub mod inspect;

use std::time::Duration;

use crate::manager::Backoff;
use crate::manager::CpuManagerConfig;

/// Checkpoint key of the CPU manager state inside the state directory.
pub const CHECKPOINT_KEY: &str = "cpu_manager_state";

impl From<&daemon::DaemonArgs> for CpuManagerConfig {
    fn from(args: &daemon::DaemonArgs) -> Self {
        Self {
            node_name: args.node_name.clone(),
            default_policy: args.default_cpu_policy,
            // A zero period would make the interval timer panic.
            reconcile_period: Duration::from_secs(args.reconcile_period_secs.max(1)),
            backoff: Backoff::default(),
        }
    }
}

pub use cli::*;
pub use daemon::*;
pub use inspect::*;
