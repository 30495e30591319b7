use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;

use crate::app::services::ApplicationServices;
use crate::app::Application;
use crate::config::DaemonArgs;
use crate::config::CHECKPOINT_KEY;
use crate::manager::CpuManager;
use crate::manager::CpuManagerConfig;
use crate::metrics::ManagerMetrics;
use crate::platform::cri::CriRuntimeClient;
use crate::platform::k8s::nrt::NrtTopologySource;
use crate::platform::k8s::pod_cache::PodCache;
use crate::platform::kube_client::init_kube_client;
use crate::policy::POLICY_NAME_STATIC;
use crate::state::CheckpointState;
use crate::state::CheckpointStore;
use crate::topology::discover;

/// Application builder
pub struct ApplicationBuilder {
    daemon_args: DaemonArgs,
}

impl ApplicationBuilder {
    pub fn new(daemon_args: DaemonArgs) -> Self {
        Self { daemon_args }
    }

    /// Builds every service and starts the CPU manager policy. Any failure
    /// here keeps the daemon from starting.
    pub async fn build(self) -> Result<Application> {
        tracing::info!("Building application components...");
        let args = &self.daemon_args;

        let topology = Arc::new(
            discover(&args.sysfs_root).with_context(|| {
                format!("failed to discover CPU topology under `{}`", args.sysfs_root.display())
            })?,
        );

        let store = CheckpointStore::new(&args.state_dir).with_context(|| {
            format!("failed to open state directory `{}`", args.state_dir.display())
        })?;
        let state = CheckpointState::new(store, CHECKPOINT_KEY, POLICY_NAME_STATIC)
            .context("failed to restore CPU manager checkpoint")?;

        let runtime = CriRuntimeClient::connect(&args.runtime_endpoint)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to the container runtime: {e:?}"))?;

        let kube_client = init_kube_client(args.kubeconfig.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {e:?}"))?;

        let pod_cache = Arc::new(PodCache::new());
        let topology_source = NrtTopologySource::new(kube_client.clone(), args.node_name.clone());
        let metrics = Arc::new(ManagerMetrics::new());

        let cpu_manager = CpuManager::new(
            CpuManagerConfig::from(args),
            topology,
            Box::new(state),
            Arc::new(runtime),
            Arc::clone(&pod_cache),
            Arc::new(topology_source),
            Arc::clone(&metrics),
        )
        .await;
        cpu_manager
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start CPU manager: {e:?}"))?;

        Ok(Application::new(
            ApplicationServices {
                cpu_manager: Arc::new(cpu_manager),
                pod_cache,
                kube_client,
                metrics,
            },
            self.daemon_args,
        ))
    }
}
