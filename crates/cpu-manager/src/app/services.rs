use std::sync::Arc;

use kube::Client;

use crate::manager::CpuManager;
use crate::metrics::ManagerMetrics;
use crate::platform::cri::CriRuntimeClient;
use crate::platform::k8s::nrt::NrtTopologySource;
use crate::platform::k8s::pod_cache::PodCache;

pub type CpuManagerType = CpuManager<CriRuntimeClient, PodCache, NrtTopologySource>;

/// Application dependencies - simple struct with Arc-wrapped services
pub struct ApplicationServices {
    pub cpu_manager: Arc<CpuManagerType>,
    pub pod_cache: Arc<PodCache>,
    pub kube_client: Client,
    pub metrics: Arc<ManagerMetrics>,
}
