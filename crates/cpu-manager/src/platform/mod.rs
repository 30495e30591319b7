//! Adapters to the outside world: the container runtime, the Kubernetes API
//! and the node's NodeResourceTopology object.
//!
//! The CPU manager only talks to the traits defined here, so tests can swap
//! in in-memory implementations.

use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Pod;

use crate::policy::TopologyResult;
use crate::topology::CpuSet;

pub mod cri;
pub mod k8s;
pub mod kube_client;

pub use cri::RuntimeError;
pub use k8s::KubernetesError;

/// Subset of the CRI `RuntimeService` the CPU manager needs.
#[async_trait]
pub trait RuntimeService: Send + Sync {
    async fn list_pod_sandboxes(&self) -> Result<Vec<cri::PodSandbox>, Report<RuntimeError>>;

    async fn list_containers(&self) -> Result<Vec<cri::Container>, Report<RuntimeError>>;

    /// Pins a running container to `cpus`.
    async fn update_container_cpuset(
        &self,
        container_id: &str,
        cpus: &CpuSet,
    ) -> Result<(), Report<RuntimeError>>;
}

/// Read access to the pods bound to this node.
pub trait PodSource: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Pod>>;

    fn list(&self) -> Vec<Arc<Pod>>;

    /// Pods that still hold resources.
    fn active_pods(&self) -> Vec<Arc<Pod>> {
        self.list()
            .into_iter()
            .filter(|pod| !k8s::pod::is_terminated(pod))
            .collect()
    }
}

/// The node-level view published by the topology scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeTopology {
    /// Whether the node's CPU manager policy is `Static`.
    pub static_policy: bool,
    pub result: TopologyResult,
}

#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn node_topology(&self) -> Result<NodeTopology, Report<KubernetesError>>;

    /// Whether the node's CPU manager policy is `Static`, without requiring
    /// the rest of the node topology to be valid.
    async fn static_cpu_policy(&self) -> Result<bool, Report<KubernetesError>> {
        self.node_topology().await.map(|node| node.static_policy)
    }
}
