//! Daemon lifecycle.
//!
//! The builder restores the checkpoint and starts the static policy before an
//! [`Application`] exists. [`Application::run`] then spawns the pod watcher,
//! the event processor, the allocation worker with the reconcile loop, and
//! the metrics reporter, and returns once a shutdown signal arrives or one of
//! them exits. [`Application::shutdown`] stops the work queue and logs the
//! final CPU pools; the checkpoint is already current since every allocation
//! is written before it takes effect.

use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::tasks::Tasks;
use crate::config::DaemonArgs;

/// A started CPU manager with everything its tasks need.
pub struct Application {
    services: ApplicationServices,
    daemon_args: DaemonArgs,
}

impl Application {
    pub fn new(services: ApplicationServices, daemon_args: DaemonArgs) -> Self {
        Self {
            services,
            daemon_args,
        }
    }

    pub fn services(&self) -> &ApplicationServices {
        &self.services
    }

    pub fn daemon_args(&self) -> &DaemonArgs {
        &self.daemon_args
    }

    /// Runs every background task until SIGTERM/SIGINT or until a task exits.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            node_name = %self.daemon_args.node_name,
            default_cpu_policy = %self.daemon_args.default_cpu_policy,
            reconcile_period_secs = self.daemon_args.reconcile_period_secs,
            "Starting CPU manager tasks"
        );

        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(self);

        if let Err(e) = tasks.wait_for_completion().await {
            tracing::error!("CPU manager task failed: {e}");
            return Err(e);
        }

        tracing::info!("CPU manager tasks stopped");
        Ok(())
    }

    /// Stops handing out queued pods and logs where the CPU pools ended up.
    pub async fn shutdown(&self) -> Result<()> {
        let cpu_manager = &self.services.cpu_manager;
        cpu_manager.queue().shutdown();

        let exclusive = cpu_manager.exclusive_cpus().await;
        let shared = cpu_manager.shared_cpus().await;
        let snapshot = self.services.metrics.snapshot();
        tracing::info!(
            exclusive_cpus = %exclusive,
            shared_cpus = %shared,
            pending_pods = cpu_manager.queue().len(),
            allocation_attempts = snapshot.allocation_attempts,
            allocation_failures = snapshot.allocation_failures,
            reconcile_failures = snapshot.reconcile_failures,
            "CPU manager shut down"
        );
        Ok(())
    }
}
